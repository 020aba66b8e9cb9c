// SPDX-License-Identifier: MIT

// boringproxy - Tunnel API
// The HTTP interface clients poll. Bearer tokens arrive in the
// Authorization header, an access_token query parameter, or a cookie; a
// token with a client scope can only register presence and list that
// client's tunnels.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use boringproxy_common::{Error, TokenData};

use crate::registry::{TunnelRegistry, TunnelRequest};
use crate::store::Store;

pub struct ApiState {
    pub store: Arc<Store>,
    pub registry: Arc<TunnelRegistry>,
    pub ssh_server_port: u16,
}

#[derive(Deserialize)]
struct TunnelsQuery {
    #[serde(rename = "client-name")]
    client_name: Option<String>,
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct ClientsQuery {
    #[serde(rename = "client-name")]
    client_name: String,
    user: Option<String>,
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct DeleteTunnelForm {
    domain: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(
            "/api/tunnels",
            get(list_tunnels).post(create_tunnel).delete(delete_tunnel),
        )
        .route("/api/clients/", post(register_client))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pull the bearer token out of the request: `Authorization: bearer <t>`,
/// `?access_token=<t>`, or an `access_token` cookie.
fn extract_token(headers: &HeaderMap, access_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some((scheme, token)) = value.split_once(' ') {
            if scheme.eq_ignore_ascii_case("bearer") {
                return Some(token.trim().to_string());
            }
        }
    }

    if let Some(token) = access_token {
        return Some(token.to_string());
    }

    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some(value) = pair.trim().strip_prefix("access_token=") {
                return Some(value.to_string());
            }
        }
    }

    None
}

fn authenticate(
    state: &ApiState,
    headers: &HeaderMap,
    access_token: Option<&str>,
) -> Result<TokenData, Response> {
    let token = extract_token(headers, access_token)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "No token provided").into_response())?;
    state
        .store
        .get_token_data(&token)
        .ok_or_else(|| (StatusCode::FORBIDDEN, "Not authorized").into_response())
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Not authorized").into_response()
}

fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::DomainInUse(_) | Error::PortInUse(_) => StatusCode::CONFLICT,
        Error::TunnelNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string()).into_response()
}

fn is_admin(state: &ApiState, owner: &str) -> bool {
    state
        .store
        .get_user(owner)
        .map(|u| u.is_admin)
        .unwrap_or(false)
}

async fn list_tunnels(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<TunnelsQuery>,
) -> Response {
    let token = match authenticate(&state, &headers, query.access_token.as_deref()) {
        Ok(token) => token,
        Err(response) => return response,
    };

    if token.is_scoped() && query.client_name.as_deref() != Some(token.client.as_str()) {
        return forbidden();
    }

    let admin = is_admin(&state, &token.owner);
    let mut tunnels = state.registry.list();
    tunnels.retain(|_, t| admin || t.owner == token.owner);
    if let Some(client_name) = &query.client_name {
        tunnels.retain(|_, t| &t.client_name == client_name);
    }

    // Scoped clients always dial the SSH port this server actually runs,
    // even if their stored record predates a config change.
    if token.is_scoped() {
        for tunnel in tunnels.values_mut() {
            tunnel.server_port = state.ssh_server_port;
        }
    }

    let body = match serde_json::to_vec(&tunnels) {
        Ok(body) => body,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let etag = format!("{:x}", md5::compute(&body));

    (
        [
            (header::ETAG, etag),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        body,
    )
        .into_response()
}

async fn create_tunnel(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<TunnelsQuery>,
    Form(mut request): Form<TunnelRequest>,
) -> Response {
    let token = match authenticate(&state, &headers, query.access_token.as_deref()) {
        Ok(token) => token,
        Err(response) => return response,
    };

    if token.is_scoped() {
        return forbidden();
    }
    if request.owner.is_empty() {
        request.owner = token.owner.clone();
    }
    if request.owner != token.owner && !is_admin(&state, &token.owner) {
        return forbidden();
    }

    match state.registry.create(request).await {
        Ok(tunnel) => Json(tunnel).into_response(),
        Err(error) => error_response(error),
    }
}

async fn delete_tunnel(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<TunnelsQuery>,
    Form(form): Form<DeleteTunnelForm>,
) -> Response {
    let token = match authenticate(&state, &headers, query.access_token.as_deref()) {
        Ok(token) => token,
        Err(response) => return response,
    };

    if token.is_scoped() {
        return forbidden();
    }
    if let Some(tunnel) = state.store.get_tunnel(&form.domain) {
        if tunnel.owner != token.owner && !is_admin(&state, &token.owner) {
            return forbidden();
        }
    }

    match state.registry.delete(&form.domain).await {
        Ok(()) => (StatusCode::OK, format!("Deleted tunnel {}", form.domain)).into_response(),
        Err(error) => error_response(error),
    }
}

async fn register_client(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ClientsQuery>,
) -> Response {
    let token = match authenticate(&state, &headers, query.access_token.as_deref()) {
        Ok(token) => token,
        Err(response) => return response,
    };

    if token.is_scoped() && query.client_name != token.client {
        return forbidden();
    }

    let user = match &query.user {
        Some(user) if !user.is_empty() => user.clone(),
        _ => token.owner.clone(),
    };
    if user != token.owner && !is_admin(&state, &token.owner) {
        return forbidden();
    }

    if let Err(error) = state.store.add_client(&user, &query.client_name) {
        return error_response(error);
    }

    info!(user = %user, client = %query.client_name, "client registered");
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use hyper::Request;
    use tower::ServiceExt;

    use boringproxy_common::{CertConfig, CertManager};
    use crate::registry::RegistryConfig;

    struct Fixture {
        router: Router,
        store: Arc<Store>,
        admin_token: String,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("db")).unwrap());
        store.add_user("admin", true).unwrap();
        let admin_token = store.add_token("admin", "").unwrap();

        let certs = CertManager::new(CertConfig::default()).unwrap();
        let registry = Arc::new(TunnelRegistry::new(
            store.clone(),
            certs,
            RegistryConfig {
                admin_domain: "bp.example".into(),
                ssh_server_port: 22,
                autocert: false,
                ssh_dir: Some(dir.path().join("ssh")),
            },
        ));

        let router = router(Arc::new(ApiState {
            store: store.clone(),
            registry,
            ssh_server_port: 2222,
        }));

        Fixture {
            router,
            store,
            admin_token,
            _dir: dir,
        }
    }

    async fn send(fx: &Fixture, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = fx.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, headers, body)
    }

    fn get_tunnels(token: &str, client_name: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(format!("/api/tunnels?client-name={client_name}"))
            .header("Authorization", format!("bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn create_form(token: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/tunnels")
            .header("Authorization", format!("bearer {token}"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_list_with_etag() {
        let fx = fixture();

        let (status, _, body) = send(
            &fx,
            create_form(
                &fx.admin_token,
                "domain=a.example&client_name=c1&tls_termination=passthrough",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

        let (status, headers, body) = send(&fx, get_tunnels(&fx.admin_token, "c1")).await;
        assert_eq!(status, StatusCode::OK);

        let tunnels: std::collections::BTreeMap<String, boringproxy_common::Tunnel> =
            serde_json::from_slice(&body).unwrap();
        assert_eq!(tunnels.len(), 1);
        assert!(tunnels.contains_key("a.example"));

        let etag = headers.get(header::ETAG).unwrap().to_str().unwrap().to_string();
        assert_eq!(etag.len(), 32);
        assert!(etag.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(etag, format!("{:x}", md5::compute(&body)));

        // Unchanged state, unchanged ETag.
        let (_, headers2, _) = send(&fx, get_tunnels(&fx.admin_token, "c1")).await;
        assert_eq!(headers2.get(header::ETAG).unwrap().to_str().unwrap(), etag);
    }

    #[tokio::test]
    async fn missing_and_unknown_tokens() {
        let fx = fixture();

        let request = Request::builder()
            .method("GET")
            .uri("/api/tunnels?client-name=c1")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&fx, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = send(&fx, get_tunnels("bogus", "c1")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn token_via_query_parameter() {
        let fx = fixture();
        let request = Request::builder()
            .method("GET")
            .uri(format!(
                "/api/tunnels?client-name=c1&access_token={}",
                fx.admin_token
            ))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&fx, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn scoped_token_restrictions() {
        let fx = fixture();
        send(
            &fx,
            create_form(
                &fx.admin_token,
                "domain=a.example&client_name=c1&tls_termination=passthrough",
            ),
        )
        .await;

        let scoped = fx.store.add_token("admin", "c1").unwrap();

        // Own client: allowed, and server_port is overwritten.
        let (status, _, body) = send(&fx, get_tunnels(&scoped, "c1")).await;
        assert_eq!(status, StatusCode::OK);
        let tunnels: std::collections::BTreeMap<String, boringproxy_common::Tunnel> =
            serde_json::from_slice(&body).unwrap();
        assert_eq!(tunnels["a.example"].server_port, 2222);

        // Someone else's client: refused.
        let (status, _, _) = send(&fx, get_tunnels(&scoped, "c2")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Scoped tokens cannot manage tunnels.
        let (status, _, _) = send(
            &fx,
            create_form(&scoped, "domain=b.example&client_name=c1"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/tunnels")
            .header("Authorization", format!("bearer {scoped}"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("domain=a.example"))
            .unwrap();
        let (status, _, _) = send(&fx, delete).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn delete_removes_tunnel() {
        let fx = fixture();
        send(
            &fx,
            create_form(
                &fx.admin_token,
                "domain=a.example&client_name=c1&tls_termination=passthrough",
            ),
        )
        .await;

        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/tunnels")
            .header("Authorization", format!("bearer {}", fx.admin_token))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("domain=a.example"))
            .unwrap();
        let (status, _, _) = send(&fx, delete).await;
        assert_eq!(status, StatusCode::OK);

        let (_, _, body) = send(&fx, get_tunnels(&fx.admin_token, "c1")).await;
        let tunnels: std::collections::BTreeMap<String, boringproxy_common::Tunnel> =
            serde_json::from_slice(&body).unwrap();
        assert!(tunnels.is_empty());
    }

    #[tokio::test]
    async fn owners_are_isolated() {
        let fx = fixture();
        fx.store.add_user("bob", false).unwrap();
        let bob_token = fx.store.add_token("bob", "").unwrap();

        send(
            &fx,
            create_form(
                &fx.admin_token,
                "domain=a.example&client_name=c1&tls_termination=passthrough",
            ),
        )
        .await;

        let (status, _, body) = send(&fx, get_tunnels(&bob_token, "c1")).await;
        assert_eq!(status, StatusCode::OK);
        let tunnels: std::collections::BTreeMap<String, boringproxy_common::Tunnel> =
            serde_json::from_slice(&body).unwrap();
        assert!(tunnels.is_empty());

        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/tunnels")
            .header("Authorization", format!("bearer {bob_token}"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("domain=a.example"))
            .unwrap();
        let (status, _, _) = send(&fx, delete).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn register_client_records_presence() {
        let fx = fixture();
        let request = Request::builder()
            .method("POST")
            .uri("/api/clients/?client-name=laptop")
            .header("Authorization", format!("bearer {}", fx.admin_token))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&fx, request).await;
        assert_eq!(status, StatusCode::OK);

        let user = fx.store.get_user("admin").unwrap();
        assert!(user.clients.contains("laptop"));
    }
}
