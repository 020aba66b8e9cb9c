// SPDX-License-Identifier: MIT

// boringproxy - Tunnel worker
// One per tunnel: connects to the server's SSH daemon with the per-tunnel
// key, opens the remote listener, and dispatches every forwarded connection
// to the local service, terminating TLS here when the tunnel asks for it.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use russh::client::{self, AuthResult};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use boringproxy_common::proxy::{forward_request, upstream_client, UpstreamTarget};
use boringproxy_common::{
    format_host_port, CertManager, TlsTermination, Tunnel, ALPN_ACME_TLS1,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A connection the server accepted on our behalf.
struct ForwardedConn {
    channel: russh::Channel<client::Msg>,
    peer: IpAddr,
}

/// Run the tunnel until shutdown is signalled or the SSH session dies.
/// Errors are terminal for this invocation; the controller restarts the
/// worker on its next reconcile.
pub async fn run(
    tunnel: Tunnel,
    certs: CertManager,
    behind_proxy: bool,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let key = decode_secret_key(&tunnel.tunnel_private_key, None)
        .context("failed to parse tunnel private key")?;

    let mut cfg = client::Config::default();
    cfg.nodelay = true;
    cfg.keepalive_interval = Some(Duration::from_secs(30));
    cfg.keepalive_max = 3;
    let config = Arc::new(cfg);

    let (forwarded_tx, mut forwarded_rx) = mpsc::unbounded_channel();
    let handler = WorkerHandler {
        server_public_key: tunnel.server_public_key.clone(),
        forwarded_tx,
    };

    info!(
        domain = %tunnel.domain,
        server = %tunnel.server_address,
        port = tunnel.server_port,
        "connecting to server"
    );
    let mut session = timeout(
        CONNECT_TIMEOUT,
        client::connect(
            config,
            (tunnel.server_address.as_str(), tunnel.server_port),
            handler,
        ),
    )
    .await
    .map_err(|_| anyhow!("connection to {} timed out", tunnel.server_address))?
    .with_context(|| format!("failed to connect to {}", tunnel.server_address))?;

    let key_with_alg = PrivateKeyWithHashAlg::new(
        Arc::new(key),
        session.best_supported_rsa_hash().await?.flatten(),
    );
    let auth = session
        .authenticate_publickey(tunnel.username.as_str(), key_with_alg)
        .await
        .context("public key authentication failed")?;
    if !matches!(auth, AuthResult::Success) {
        bail!("server rejected the tunnel key for user {}", tunnel.username);
    }

    let bound = session
        .tcpip_forward(tunnel.bind_address(), tunnel.tunnel_port as u32)
        .await
        .context("failed to open remote listener")?;
    if bound != 0 && bound != tunnel.tunnel_port as u32 {
        warn!(
            requested = tunnel.tunnel_port,
            bound, "server bound a different port"
        );
    }

    let tls_acceptor = if tunnel.tls_termination.is_terminated_at_client() {
        certs
            .manage_sync(std::slice::from_ref(&tunnel.domain))
            .context("failed to obtain tunnel certificate")?;
        Some(TlsAcceptor::from(certs.server_config()))
    } else {
        None
    };
    let http_client = if tunnel.tls_termination == TlsTermination::Client {
        Some(upstream_client().context("failed to build local HTTP client")?)
    } else {
        None
    };

    info!(
        domain = %tunnel.domain,
        tunnel_port = tunnel.tunnel_port,
        upstream = %format_host_port(&tunnel.client_address, tunnel.client_port),
        "tunnel established"
    );

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break Ok(()),
            conn = forwarded_rx.recv() => match conn {
                Some(conn) => {
                    let tunnel = tunnel.clone();
                    let tls = tls_acceptor.clone();
                    let client = http_client.clone();
                    tokio::spawn(async move {
                        handle_forwarded(conn, tunnel, tls, client, behind_proxy).await;
                    });
                }
                None => break Err(anyhow!("ssh session closed")),
            },
        }
    };

    let _ = session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    result
}

async fn handle_forwarded(
    conn: ForwardedConn,
    tunnel: Tunnel,
    tls: Option<TlsAcceptor>,
    http_client: Option<reqwest::Client>,
    behind_proxy: bool,
) {
    match tunnel.tls_termination {
        TlsTermination::Client => {
            if let (Some(tls), Some(client)) = (tls, http_client) {
                serve_terminated_http(conn, tunnel, tls, client, behind_proxy).await;
            }
        }
        TlsTermination::ClientTls => {
            if let Some(tls) = tls {
                pipe_terminated(conn, tunnel, tls).await;
            }
        }
        // Server-terminated and passthrough tunnels carry opaque bytes here.
        _ => pipe_raw(conn, tunnel).await,
    }
}

/// `client` termination: handshake on the forwarded stream, then serve HTTP
/// and reverse-proxy each request to the local service.
async fn serve_terminated_http(
    conn: ForwardedConn,
    tunnel: Tunnel,
    tls: TlsAcceptor,
    http_client: reqwest::Client,
    behind_proxy: bool,
) {
    let tls_stream = match tls.accept(conn.channel.into_stream()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(domain = %tunnel.domain, error = %e, "TLS handshake failed");
            return;
        }
    };
    if tls_stream.get_ref().1.alpn_protocol() == Some(ALPN_ACME_TLS1) {
        return;
    }

    let peer = conn.peer;
    let target = UpstreamTarget {
        address: tunnel.client_address.clone(),
        port: tunnel.client_port,
        host_header: tunnel.domain.clone(),
        auth_username: tunnel.auth_username.clone(),
        auth_password: tunnel.auth_password.clone(),
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let target = target.clone();
        let client = http_client.clone();
        async move {
            Ok::<_, Infallible>(
                forward_request(req, &target, &client, peer, true, behind_proxy).await,
            )
        }
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
    {
        debug!(domain = %tunnel.domain, error = %e, "forwarded connection ended");
    }
}

/// `client-tls` termination: handshake here, raw bytes to the local service.
async fn pipe_terminated(conn: ForwardedConn, tunnel: Tunnel, tls: TlsAcceptor) {
    let mut tls_stream = match tls.accept(conn.channel.into_stream()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(domain = %tunnel.domain, error = %e, "TLS handshake failed");
            return;
        }
    };
    if tls_stream.get_ref().1.alpn_protocol() == Some(ALPN_ACME_TLS1) {
        return;
    }

    let addr = format_host_port(&tunnel.client_address, tunnel.client_port);
    let mut local = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(domain = %tunnel.domain, addr = %addr, error = %e, "local service unavailable");
            return;
        }
    };

    if let Err(e) = copy_bidirectional(&mut tls_stream, &mut local).await {
        debug!(domain = %tunnel.domain, error = %e, "forwarded connection ended");
    }
}

/// Opaque byte pipe between the forwarded channel and the local service.
async fn pipe_raw(conn: ForwardedConn, tunnel: Tunnel) {
    let addr = format_host_port(&tunnel.client_address, tunnel.client_port);
    let mut local = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(domain = %tunnel.domain, addr = %addr, error = %e, "local service unavailable");
            let _ = conn.channel.close().await;
            return;
        }
    };

    let mut channel_stream = conn.channel.into_stream();
    match copy_bidirectional(&mut channel_stream, &mut local).await {
        Ok((from_remote, from_local)) => {
            debug!(
                domain = %tunnel.domain,
                from_remote,
                from_local,
                "forwarded connection closed"
            );
        }
        Err(e) => debug!(domain = %tunnel.domain, error = %e, "forwarded connection ended"),
    }
    let _ = channel_stream.shutdown().await;
}

struct WorkerHandler {
    server_public_key: String,
    forwarded_tx: mpsc::UnboundedSender<ForwardedConn>,
}

impl client::Handler for WorkerHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // No pinned key on the tunnel record means any host key is accepted.
        if self.server_public_key.is_empty() {
            return Ok(true);
        }

        let offered = server_public_key.to_openssh().map_err(|e| {
            russh::Error::from(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failed to encode host key: {e}"),
            ))
        })?;

        if keys_match(&offered, &self.server_public_key) {
            Ok(true)
        } else {
            warn!("server host key does not match the pinned key");
            Ok(false)
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let peer = originator_address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        // The queue only closes when the worker is exiting; the server will
        // see the channel close.
        let _ = self.forwarded_tx.send(ForwardedConn { channel, peer });
        Ok(())
    }
}

/// Compare two authorized-keys encoded public keys by algorithm and key
/// material, ignoring comments.
fn keys_match(a: &str, b: &str) -> bool {
    fn fields(key: &str) -> Option<(String, String)> {
        let mut parts = key.split_whitespace();
        Some((parts.next()?.to_string(), parts.next()?.to_string()))
    }
    match (fields(a), fields(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_keys_ignore_comments() {
        assert!(keys_match(
            "ssh-ed25519 AAAAC3Nza host-a",
            "ssh-ed25519 AAAAC3Nza boringproxy"
        ));
    }

    #[test]
    fn different_material_does_not_match() {
        assert!(!keys_match(
            "ssh-ed25519 AAAAC3Nza",
            "ssh-ed25519 AAAAdifferent"
        ));
    }

    #[test]
    fn different_algorithm_does_not_match() {
        assert!(!keys_match("ssh-rsa AAAAC3Nza", "ssh-ed25519 AAAAC3Nza"));
    }

    #[test]
    fn malformed_keys_do_not_match() {
        assert!(!keys_match("", "ssh-ed25519 AAAAC3Nza"));
        assert!(!keys_match("ssh-ed25519", "ssh-ed25519"));
    }
}
