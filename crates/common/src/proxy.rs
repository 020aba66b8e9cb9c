// SPDX-License-Identifier: MIT

// boringproxy - HTTP forwarding core
// The request path shared by server-side TLS termination (upstream is the
// tunnel's loopback port) and client-side termination (upstream is the local
// service). Streams bodies in both directions and never follows redirects.

use std::net::IpAddr;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyDataStream, BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode, Version};
use tracing::warn;

use crate::format_host_port;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Delay before answering a request that presented wrong credentials.
const BAD_AUTH_DELAY: Duration = Duration::from_secs(2);

/// Headers that must not cross an HTTP/2 -> HTTP/1.1 boundary.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Where a proxied request should be sent.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub address: String,
    pub port: u16,
    /// Host header presented to the upstream service.
    pub host_header: String,
    pub auth_username: String,
    pub auth_password: String,
}

/// HTTP client for upstream requests. Redirects are returned to the caller
/// untouched rather than followed.
pub fn upstream_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed_unsync()
}

pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn unauthorized() -> Response<ProxyBody> {
    let mut response = text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
    response
}

#[derive(Debug, PartialEq, Eq)]
enum BasicAuthCheck {
    Authorized,
    Missing,
    Mismatch,
}

fn check_basic_auth(headers: &HeaderMap, username: &str, password: &str) -> BasicAuthCheck {
    let value = match headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(v) => v,
        None => return BasicAuthCheck::Missing,
    };

    let (scheme, encoded) = match value.split_once(' ') {
        Some(parts) => parts,
        None => return BasicAuthCheck::Missing,
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return BasicAuthCheck::Missing;
    }

    let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return BasicAuthCheck::Mismatch,
    };
    let text = match String::from_utf8(decoded) {
        Ok(text) => text,
        Err(_) => return BasicAuthCheck::Mismatch,
    };
    match text.split_once(':') {
        Some((user, pass)) if user == username && pass == password => BasicAuthCheck::Authorized,
        _ => BasicAuthCheck::Mismatch,
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn set_forwarding_headers(
    headers: &mut HeaderMap,
    original_host: &str,
    peer_ip: IpAddr,
    tls: bool,
    behind_proxy: bool,
) {
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert("x-forwarded-host", value);
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if tls { "https" } else { "http" }),
    );

    let peer = peer_ip.to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if behind_proxy => format!("{existing}, {peer}"),
        _ => peer.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("for={peer}")) {
        headers.insert(header::FORWARDED, value);
    }
}

/// Forward one request to `target`, streaming the body through. Basic auth
/// is enforced first when the target carries credentials; upstream failures
/// come back as 502.
pub async fn forward_request<B>(
    req: Request<B>,
    target: &UpstreamTarget,
    client: &reqwest::Client,
    peer_ip: IpAddr,
    tls: bool,
    behind_proxy: bool,
) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    if !target.auth_username.is_empty() || !target.auth_password.is_empty() {
        match check_basic_auth(req.headers(), &target.auth_username, &target.auth_password) {
            BasicAuthCheck::Authorized => {}
            BasicAuthCheck::Missing => return unauthorized(),
            BasicAuthCheck::Mismatch => {
                tokio::time::sleep(BAD_AUTH_DELAY).await;
                return unauthorized();
            }
        }
    }

    let original_host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_else(|| target.host_header.clone());

    let method = req.method().clone();
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let version = req.version();

    let mut headers = req.headers().clone();
    headers.remove(header::HOST);
    if version == Version::HTTP_2 {
        strip_hop_by_hop(&mut headers);
    }
    set_forwarding_headers(&mut headers, &original_host, peer_ip, tls, behind_proxy);

    let host_value = match HeaderValue::from_str(&target.host_header) {
        Ok(value) => value,
        Err(_) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid upstream host")
        }
    };
    headers.insert(header::HOST, host_value);

    let url = format!(
        "http://{}{}",
        format_host_port(&target.address, target.port),
        request_uri
    );
    let body = reqwest::Body::wrap_stream(BodyDataStream::new(req.into_body()));

    let upstream = match client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "upstream request failed");
            return text_response(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| -> BoxError { Box::new(e) });

    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = upstream_headers;
    response
}
