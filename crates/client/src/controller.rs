// SPDX-License-Identifier: MIT

// boringproxy - Client controller
// Polls the tunnel API every two seconds, short-circuiting on an unchanged
// ETag, and reconciles the desired tunnel set against running workers. Each
// worker owns a shutdown channel; dropping the sender stops it too.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use boringproxy_common::{CertManager, Tunnel};

use crate::worker;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub server: String,
    pub token: String,
    pub client_name: String,
    pub user: String,
    pub behind_proxy: bool,
}

#[derive(Clone)]
pub struct ClientController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ControllerConfig,
    http: reqwest::Client,
    certs: CertManager,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    last_etag: Mutex<Option<String>>,
    next_worker_id: AtomicU64,
}

struct WorkerHandle {
    id: u64,
    tunnel: Tunnel,
    shutdown_tx: mpsc::Sender<()>,
}

impl ClientController {
    pub fn new(config: ControllerConfig, certs: CertManager) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                certs,
                workers: Mutex::new(HashMap::new()),
                last_etag: Mutex::new(None),
                next_worker_id: AtomicU64::new(0),
            }),
        })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.register().await?;

        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!(error = %e, "tunnel poll failed");
                    }
                }
            }
        }

        self.stop_all().await;
        Ok(())
    }

    fn base_url(&self) -> String {
        let server = self.inner.config.server.trim_end_matches('/');
        if server.contains("://") {
            server.to_string()
        } else {
            format!("https://{server}")
        }
    }

    fn bearer(&self) -> String {
        format!("bearer {}", self.inner.config.token)
    }

    /// Announce this client to the server. A failure here is fatal: the
    /// token or server is wrong, and polling would only repeat the error.
    async fn register(&self) -> Result<()> {
        let config = &self.inner.config;
        let mut request = self
            .inner
            .http
            .post(format!("{}/api/clients/", self.base_url()))
            .query(&[("client-name", config.client_name.as_str())])
            .header(header::AUTHORIZATION, self.bearer());
        if !config.user.is_empty() {
            request = request.query(&[("user", config.user.as_str())]);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to reach server {}", config.server))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("client registration failed: {status}: {body}");
        }

        info!(client_name = %config.client_name, "registered with server");
        Ok(())
    }

    async fn poll(&self) -> Result<()> {
        let config = &self.inner.config;
        let response = self
            .inner
            .http
            .get(format!("{}/api/tunnels", self.base_url()))
            .query(&[("client-name", config.client_name.as_str())])
            .header(header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .context("failed to fetch tunnels")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("tunnel listing failed: {status}: {body}");
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if etag.is_some() && *self.inner.last_etag.lock().await == etag {
            return Ok(());
        }

        let desired: HashMap<String, Tunnel> =
            response.json().await.context("failed to decode tunnels")?;
        self.sync_tunnels(desired).await;

        // Only remember the ETag once the set was actually applied.
        *self.inner.last_etag.lock().await = etag;
        Ok(())
    }

    /// Reconcile running workers against the desired set: start what is
    /// missing, stop what is gone, restart what changed.
    pub async fn sync_tunnels(&self, desired: HashMap<String, Tunnel>) {
        let mut workers = self.inner.workers.lock().await;

        let running: HashMap<String, Tunnel> = workers
            .iter()
            .map(|(domain, handle)| (domain.clone(), handle.tunnel.clone()))
            .collect();
        let plan = diff_tunnels(&desired, &running);

        for domain in &plan.stop {
            if let Some(handle) = workers.remove(domain) {
                info!(domain = %domain, "stopping tunnel worker");
                let _ = handle.shutdown_tx.try_send(());
            }
        }

        for domain in &plan.start {
            let tunnel = desired[domain].clone();
            let handle = self.spawn_worker(tunnel);
            workers.insert(domain.clone(), handle);
        }
    }

    fn spawn_worker(&self, tunnel: Tunnel) -> WorkerHandle {
        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let inner = self.inner.clone();
        let domain = tunnel.domain.clone();
        let worker_tunnel = tunnel.clone();

        info!(domain = %domain, "starting tunnel worker");
        tokio::spawn(async move {
            let result = worker::run(
                worker_tunnel,
                inner.certs.clone(),
                inner.config.behind_proxy,
                shutdown_rx,
            )
            .await;

            match result {
                Ok(()) => info!(domain = %domain, "tunnel worker stopped"),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "tunnel worker failed");
                    // Drop our bookkeeping (unless a replacement already
                    // took the slot) and force a re-sync on the next poll.
                    let mut workers = inner.workers.lock().await;
                    if workers.get(&domain).map(|h| h.id) == Some(id) {
                        workers.remove(&domain);
                    }
                    drop(workers);
                    *inner.last_etag.lock().await = None;
                }
            }
        });

        WorkerHandle {
            id,
            tunnel,
            shutdown_tx,
        }
    }

    pub async fn stop_all(&self) {
        let mut workers = self.inner.workers.lock().await;
        for (domain, handle) in workers.drain() {
            info!(domain = %domain, "stopping tunnel worker");
            let _ = handle.shutdown_tx.try_send(());
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SyncPlan {
    pub start: Vec<String>,
    pub stop: Vec<String>,
}

/// Pure reconciliation step: which domains must start and which must stop.
/// A tunnel whose record changed in any field appears in both lists.
pub(crate) fn diff_tunnels(
    desired: &HashMap<String, Tunnel>,
    running: &HashMap<String, Tunnel>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (domain, tunnel) in desired {
        match running.get(domain) {
            None => plan.start.push(domain.clone()),
            Some(current) if current != tunnel => {
                plan.stop.push(domain.clone());
                plan.start.push(domain.clone());
            }
            Some(_) => {}
        }
    }
    for domain in running.keys() {
        if !desired.contains_key(domain) {
            plan.stop.push(domain.clone());
        }
    }

    plan.start.sort();
    plan.stop.sort();
    plan
}
