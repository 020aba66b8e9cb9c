// SPDX-License-Identifier: MIT

// boringproxy - Server
// Public TLS front, tunnel registry, and the API clients poll.

mod api;
mod front;
mod probe;
mod redirect;
mod registry;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boringproxy_common::proxy::upstream_client;
use boringproxy_common::{CertConfig, CertManager};

use api::ApiState;
use front::ServerContext;
use registry::{RegistryConfig, TunnelRegistry};
use store::Store;

#[derive(Parser, Debug)]
#[command(name = "boringproxy-server", about = "Reverse-tunneling HTTPS proxy server")]
struct ServerArgs {
    /// Domain the admin interface and API are served on
    #[arg(long, env = "BP_ADMIN_DOMAIN")]
    admin_domain: Option<String>,

    /// Port of the host SSH daemon clients dial for tunnels
    #[arg(long, env = "BP_SSH_SERVER_PORT", default_value_t = 22)]
    ssh_server_port: u16,

    /// Directory holding the database file
    #[arg(long, env = "BP_DB_DIR", default_value = ".")]
    db_dir: PathBuf,

    /// Directory holding issued certificates
    #[arg(long, env = "BP_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// HTTP (insecure) port
    #[arg(long, env = "BP_HTTP_PORT", default_value_t = 80)]
    http_port: u16,

    /// HTTPS port
    #[arg(long, env = "BP_HTTPS_PORT", default_value_t = 443)]
    https_port: u16,

    /// Serve plaintext HTTP instead of redirecting to HTTPS
    #[arg(long, env = "BP_ALLOW_HTTP")]
    allow_http: bool,

    /// Public IP to self-test against at startup
    #[arg(long, env = "BP_PUBLIC_IP")]
    public_ip: Option<String>,

    /// Running behind another reverse proxy
    #[arg(long, env = "BP_BEHIND_PROXY")]
    behind_proxy: bool,

    /// Email for certificate issuance
    #[arg(long, env = "BP_ACME_EMAIL")]
    acme_email: Option<String>,

    /// Use the staging CA
    #[arg(long, env = "BP_ACME_USE_STAGING")]
    acme_use_staging: bool,

    /// Accept the CA's terms of service
    #[arg(long, env = "BP_ACCEPT_CA_TERMS")]
    accept_ca_terms: bool,

    /// Custom CA URL
    #[arg(long, env = "BP_CUSTOM_CA")]
    custom_ca: Option<String>,

    /// Automatically obtain certificates for server-terminated tunnels
    #[arg(long, env = "BP_AUTOCERT", default_value_t = true)]
    autocert: bool,

    /// Print admin login information at startup
    #[arg(long, env = "BP_PRINT_LOGIN")]
    print_login: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "boringproxy_server=info,boringproxy_common=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = ServerArgs::parse();
    info!("boringproxy server starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(Store::open(&args.db_dir).context("failed to open database")?);

    if let Some(domain) = &args.admin_domain {
        store.set_admin_domain(domain)?;
    }
    let admin_domain = store.get_admin_domain();
    if admin_domain.is_empty() {
        bail!("admin-domain is required (flag, BP_ADMIN_DOMAIN, or a prior run)");
    }
    info!(admin_domain = %admin_domain, "admin domain configured");

    let certs = CertManager::new(CertConfig {
        dir: args.cert_dir.clone(),
        acme_email: args.acme_email.clone(),
        acme_use_staging: args.acme_use_staging,
        accept_ca_terms: args.accept_ca_terms,
        ca_url: args.custom_ca.clone(),
    })
    .context("failed to initialize certificate manager")?;

    certs
        .manage_sync(std::slice::from_ref(&admin_domain))
        .context("failed to obtain admin certificate")?;

    ensure_admin_login(&store, &admin_domain, args.print_login)?;

    let registry = Arc::new(TunnelRegistry::new(
        store.clone(),
        certs.clone(),
        RegistryConfig {
            admin_domain: admin_domain.clone(),
            ssh_server_port: args.ssh_server_port,
            autocert: args.autocert,
            ssh_dir: None,
        },
    ));

    // Warm certificates for tunnels that survived a restart.
    if args.autocert {
        let domains: Vec<String> = store
            .get_tunnels()
            .values()
            .filter(|t| t.tls_termination.is_terminated_at_server())
            .map(|t| t.domain.clone())
            .collect();
        if let Err(e) = certs.manage_sync(&domains) {
            warn!(error = %e, "failed to warm tunnel certificates");
        }
    }

    let api = api::router(Arc::new(ApiState {
        store: store.clone(),
        registry,
        ssh_server_port: args.ssh_server_port,
    }));

    if let Some(public_ip) = &args.public_ip {
        match probe::check_public_address(public_ip, args.https_port).await {
            Ok(()) => info!(public_ip = %public_ip, "public address self-test passed"),
            Err(e) => warn!(public_ip = %public_ip, error = %e, "public address self-test failed"),
        }
    }

    let ctx = Arc::new(ServerContext {
        store,
        api,
        admin_domain,
        behind_proxy: args.behind_proxy,
        http_client: upstream_client().context("failed to build upstream HTTP client")?,
        tls_acceptor: TlsAcceptor::from(certs.server_config()),
    });

    let https_listener = TcpListener::bind(("0.0.0.0", args.https_port))
        .await
        .with_context(|| format!("failed to bind HTTPS port {}", args.https_port))?;
    let http_listener = TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .with_context(|| format!("failed to bind HTTP port {}", args.http_port))?;

    tokio::spawn(redirect::run(
        http_listener,
        ctx.clone(),
        args.allow_http,
        args.https_port,
    ));
    tokio::spawn(front::run(https_listener, ctx));

    info!("boringproxy server ready");
    wait_for_shutdown().await;
    info!("server shut down");
    Ok(())
}

/// First start bootstraps the admin user and an unscoped token. The token is
/// only printed on creation or when explicitly asked for.
fn ensure_admin_login(store: &Store, admin_domain: &str, print_login: bool) -> Result<()> {
    if !store.has_users() {
        store.add_user("admin", true)?;
        let token = store.add_token("admin", "")?;
        info!("created admin user");
        info!(
            "Admin login: https://{}/?access_token={}",
            admin_domain, token
        );
        return Ok(());
    }

    if print_login {
        let token = store.add_token("admin", "")?;
        info!(
            "Admin login: https://{}/?access_token={}",
            admin_domain, token
        );
    }
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
