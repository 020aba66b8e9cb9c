// SPDX-License-Identifier: MIT

// boringproxy - Client
// Polls the server's tunnel set and keeps one SSH worker per tunnel alive.

mod controller;
mod worker;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boringproxy_common::{CertConfig, CertManager};

use controller::{ClientController, ControllerConfig};

#[derive(Parser, Debug)]
#[command(name = "boringproxy-client", about = "Reverse-tunneling HTTPS proxy client")]
struct ClientArgs {
    /// boringproxy server (host or URL)
    #[arg(long, env = "BP_SERVER")]
    server: String,

    /// Access token
    #[arg(long, env = "BP_TOKEN")]
    token: String,

    /// Name this client registers under
    #[arg(long, env = "BP_CLIENT_NAME", default_value = "default")]
    client_name: String,

    /// User the client belongs to
    #[arg(long, env = "BP_USER")]
    user: Option<String>,

    /// Directory holding issued certificates
    #[arg(long, env = "BP_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Email for certificate issuance
    #[arg(long, env = "BP_ACME_EMAIL")]
    acme_email: Option<String>,

    /// Use the staging CA
    #[arg(long, env = "BP_ACME_USE_STAGING")]
    acme_use_staging: bool,

    /// Custom DNS server for certificate checks
    #[arg(long, env = "BP_DNS_SERVER")]
    dns_server: Option<String>,

    /// Running behind another reverse proxy
    #[arg(long, env = "BP_BEHIND_PROXY")]
    behind_proxy: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boringproxy_client=info,boringproxy_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = ClientArgs::parse();
    info!("boringproxy client starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Some(dns_server) = &args.dns_server {
        info!(dns_server = %dns_server, "using custom DNS server");
    }

    let certs = CertManager::new(CertConfig {
        dir: args.cert_dir.clone(),
        acme_email: args.acme_email.clone(),
        acme_use_staging: args.acme_use_staging,
        accept_ca_terms: false,
        ca_url: None,
    })
    .context("failed to initialize certificate manager")?;

    let controller = ClientController::new(
        ControllerConfig {
            server: args.server,
            token: args.token,
            client_name: args.client_name,
            user: args.user.unwrap_or_default(),
            behind_proxy: args.behind_proxy,
        },
        certs,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    controller.run(shutdown_rx).await?;
    info!("client shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down");
    }
}
