// SPDX-License-Identifier: MIT

// boringproxy - Front listener
// Accepts public TLS traffic, peeks the ClientHello, and routes by SNI and
// tunnel policy: passthrough tunnels get a raw byte pipe to their loopback
// port, everything else is terminated here and served as HTTP. The admin
// domain's requests are handed to the API router.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, error, info, warn};

use boringproxy_common::proxy::{
    forward_request, text_response, BoxError, ProxyBody, UpstreamTarget,
};
use boringproxy_common::{
    format_host_port, peek_client_hello, strip_port, PeekedStream, Tunnel, ALPN_ACME_TLS1,
};

use crate::store::Store;

pub struct ServerContext {
    pub store: Arc<Store>,
    pub api: Router,
    pub admin_domain: String,
    pub behind_proxy: bool,
    pub http_client: reqwest::Client,
    pub tls_acceptor: TlsAcceptor,
}

pub async fn run(listener: TcpListener, ctx: Arc<ServerContext>) {
    info!(addr = ?listener.local_addr().ok(), "front listener accepting connections");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }

        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx).await;
        });
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) {
    let (peeked, server_name) = match peek_client_hello(&mut stream).await {
        Ok(result) => result,
        Err(e) => {
            debug!(peer = %peer, error = %e, "failed to read ClientHello");
            return;
        }
    };

    let tunnel = server_name
        .as_deref()
        .and_then(|name| ctx.store.get_tunnel(name));
    let replay = PeekedStream::new(peeked, stream);

    match tunnel {
        Some(tunnel) if tunnel.tls_termination.is_passthrough_at_server() => {
            passthrough(replay, tunnel, peer).await;
        }
        // Terminated tunnels, the admin domain, and unknown names all get a
        // local handshake; unknown names are served with the default cert.
        _ => terminate(replay, peer, ctx).await,
    }
}

/// End-to-end byte pipe between the accepted connection and the tunnel's
/// loopback port. Half-close propagates in both directions; no retries,
/// because a dead loopback dial means the tunnel itself is down.
async fn passthrough(mut replay: PeekedStream<TcpStream>, tunnel: Tunnel, peer: SocketAddr) {
    let addr = format_host_port("localhost", tunnel.tunnel_port);
    let mut upstream = match TcpStream::connect(&addr).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(domain = %tunnel.domain, addr = %addr, error = %e, "no tunnel listener");
            return;
        }
    };

    match copy_bidirectional(&mut replay, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(
                domain = %tunnel.domain,
                peer = %peer,
                to_upstream,
                to_client,
                "passthrough connection closed"
            );
        }
        Err(e) => debug!(domain = %tunnel.domain, peer = %peer, error = %e, "passthrough ended"),
    }
}

async fn terminate(replay: PeekedStream<TcpStream>, peer: SocketAddr, ctx: Arc<ServerContext>) {
    let tls_stream = match ctx.tls_acceptor.accept(replay).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    // TLS-ALPN-01 challenge connections end right after the handshake.
    if tls_stream.get_ref().1.alpn_protocol() == Some(ALPN_ACME_TLS1) {
        return;
    }

    let service_ctx = ctx.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = service_ctx.clone();
        async move { Ok::<_, Infallible>(handle_request(req, ctx, peer.ip(), true).await) }
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
    {
        let message = e.to_string();
        if message.contains("connection closed") || message.contains("Broken pipe") {
            debug!(peer = %peer, "client disconnected");
        } else {
            warn!(peer = %peer, error = %message, "error serving connection");
        }
    }
}

/// Route one decrypted request: API router for the admin domain, the
/// reverse proxy for server-terminated tunnels, a 5xx for everything else.
pub async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ServerContext>,
    peer_ip: IpAddr,
    tls: bool,
) -> Response<ProxyBody> {
    let host = request_host(&req);

    if host == ctx.admin_domain {
        let mut api = ctx.api.clone();
        return match api.call(req).await {
            Ok(response) => {
                response.map(|body| body.map_err(|e| -> BoxError { Box::new(e) }).boxed_unsync())
            }
            Err(never) => match never {},
        };
    }

    match ctx.store.get_tunnel(&host) {
        Some(tunnel) if tunnel.tls_termination.is_terminated_at_server() => {
            let target = UpstreamTarget {
                address: "localhost".to_string(),
                port: tunnel.tunnel_port,
                host_header: tunnel.domain.clone(),
                auth_username: tunnel.auth_username.clone(),
                auth_password: tunnel.auth_password.clone(),
            };
            forward_request(req, &target, &ctx.http_client, peer_ip, tls, ctx.behind_proxy).await
        }
        _ => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("No tunnel attached to {host}"),
        ),
    }
}

/// Host the request addressed, from the Host header or the :authority
/// pseudo-header, without any port suffix.
pub fn request_host<B>(req: &Request<B>) -> String {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default();
    strip_port(&host).to_string()
}
