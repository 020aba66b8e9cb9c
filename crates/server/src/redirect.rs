// SPDX-License-Identifier: MIT

// boringproxy - HTTP redirector
// Port-80 listener. By default every request is redirected to the HTTPS
// port; with allow-http the same root handler as the TLS side is served in
// plaintext.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use boringproxy_common::proxy::{full_body, ProxyBody};

use crate::front::{handle_request, request_host, ServerContext};

pub async fn run(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    allow_http: bool,
    https_port: u16,
) {
    info!(
        addr = ?listener.local_addr().ok(),
        allow_http,
        "http listener accepting connections"
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let ctx = ctx.clone();
                async move {
                    let response = if allow_http {
                        handle_request(req, ctx, peer.ip(), false).await
                    } else {
                        redirect_response(&req, https_port)
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "http connection ended");
            }
        });
    }
}

fn redirect_response<B>(req: &Request<B>, https_port: u16) -> Response<ProxyBody> {
    let host = request_host(req);
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}:{https_port}{uri}");

    let mut response = Response::new(full_body(""));
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirects_to_https_port() {
        let req = Request::builder()
            .uri("/path?x=1")
            .header(header::HOST, "a.example")
            .body(())
            .unwrap();
        let response = redirect_response(&req, 443);

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://a.example:443/path?x=1"
        );
    }

    #[test]
    fn redirect_drops_incoming_port() {
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "a.example:8080")
            .body(())
            .unwrap();
        let response = redirect_response(&req, 8443);

        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://a.example:8443/"
        );
    }
}
