// SPDX-License-Identifier: MIT

// boringproxy - Public address self-test
// Confirms the advertised public IP actually routes back to this host by
// pushing a random nonce through it before the front listener takes the
// port. Callers decide whether a failure is fatal; startup treats it as a
// warning only.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn check_public_address(host: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind probe listener on port {port}"))?;

    let nonce = *uuid::Uuid::new_v4().as_bytes();

    let accept = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await?;
        let mut buf = [0u8; 16];
        timeout(PROBE_TIMEOUT, conn.read_exact(&mut buf))
            .await
            .map_err(|_| anyhow!("probe read timed out"))??;
        Ok::<_, anyhow::Error>(buf)
    });

    let mut conn = timeout(PROBE_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow!("dial to {host}:{port} timed out"))?
        .with_context(|| format!("failed to dial {host}:{port}"))?;
    conn.write_all(&nonce).await?;
    drop(conn);

    let received = timeout(Duration::from_secs(2), accept)
        .await
        .map_err(|_| anyhow!("probe connection never arrived at {host}:{port}"))???;

    if received != nonce {
        bail!("traffic to {host}:{port} reached a different server");
    }
    Ok(())
}
