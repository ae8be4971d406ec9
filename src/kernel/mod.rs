//! Hub - owns the running Cores, the registry snapshot, and shutdown.
//!
//! All mutable state lives on one [`Hub`] instance. The Core map is only
//! touched under its async mutex, which also serializes reconciliation
//! passes. The registry is replaced as a whole after every change to the
//! Core map.
//!
//! ```text
//!   manifest ──> Reconciler ──> Cores ──> Registry snapshot
//!                                 ^             │
//!   client ──> Dispatcher ────────┴─────────────┘
//! ```

pub mod admission;
pub mod core_process;
pub mod rate_limiter;
pub mod reconciler;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manifest::watcher::ManifestWatcher;
use crate::manifest::Manifest;
use crate::metrics::Metrics;
use crate::types::{Error, HubConfig, Result};
use core_process::{CoreProcess, CoreTimeouts};
use reconciler::{ProcessSupervisor, ReconcileReport, Reconciler, Supervisor};
use registry::{Registry, SharedRegistry};

/// Delay between acknowledging `hub/test/exit` and shutting down.
pub const TEST_EXIT_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    reconciler: Reconciler,
    cores: Mutex<BTreeMap<String, Arc<CoreProcess>>>,
    registry: SharedRegistry,
    metrics: Metrics,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Hub {
    /// Hub that spawns Cores as child processes.
    pub fn new(config: HubConfig) -> Arc<Self> {
        let timeouts = CoreTimeouts {
            handshake: config.handshake_timeout,
            call: config.call_timeout,
        };
        Self::with_supervisor(config, Arc::new(ProcessSupervisor::new(timeouts)))
    }

    pub fn with_supervisor(config: HubConfig, supervisor: Arc<dyn Supervisor>) -> Arc<Self> {
        Arc::new(Self {
            config,
            reconciler: Reconciler::new(supervisor),
            cores: Mutex::new(BTreeMap::new()),
            registry: SharedRegistry::new(),
            metrics: Metrics::new(),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        })
    }

    /// Load the configured manifest and run the initial reconciliation.
    pub async fn boot(self: &Arc<Self>) -> Result<ReconcileReport> {
        let path = self
            .config
            .manifest_path
            .as_deref()
            .ok_or_else(|| Error::config("HUB_MANIFEST is not set"))?;
        let manifest = Manifest::load(path)?;
        self.reconcile(&manifest).await
    }

    /// Converge the running Cores onto `manifest` and publish a new registry.
    ///
    /// An invalid manifest is rejected before anything is stopped or started.
    pub async fn reconcile(self: &Arc<Self>, manifest: &Manifest) -> Result<ReconcileReport> {
        let mut cores = self.cores.lock().await;
        let report = self.reconciler.apply(manifest, &mut cores).await?;

        for name in report.added.iter().chain(report.restarted.iter()) {
            if let Some(core) = cores.get(name) {
                self.watch_exit(name.clone(), Arc::clone(core));
            }
        }

        let registry = Registry::build(cores.values());
        tracing::info!(
            tools = registry.len(),
            cores = cores.len(),
            "registry_reconciled"
        );
        self.registry.store(registry);
        Ok(report)
    }

    /// Reload the manifest from disk and reconcile.
    pub async fn reload(self: &Arc<Self>) -> Result<ReconcileReport> {
        self.boot().await.map_err(|e| {
            tracing::warn!(error = %e, "manifest_reload_invalid");
            e
        })
    }

    /// Reconcile on every debounced change to the manifest file.
    ///
    /// Returns `None` when no manifest path is configured.
    pub fn spawn_manifest_watcher(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>> {
        let Some(path) = self.config.manifest_path.clone() else {
            return Ok(None);
        };
        let (watcher, mut ticks) = ManifestWatcher::new(&path, self.config.reload_debounce)?;
        let hub = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        Ok(Some(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    tick = ticks.recv() => {
                        if tick.is_none() {
                            break;
                        }
                        let Some(hub) = hub.upgrade() else { break };
                        tracing::info!("Manifest changed, reconciling");
                        let _ = hub.reload().await;
                    }
                }
            }
        })))
    }

    /// Drop a crashed Core from the live set if it is still current.
    fn watch_exit(self: &Arc<Self>, name: String, core: Arc<CoreProcess>) {
        let hub: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            core.exited().await;
            if core.is_terminating() {
                return;
            }
            let Some(hub) = hub.upgrade() else { return };
            let mut cores = hub.cores.lock().await;
            let current = cores.get(&name).is_some_and(|c| Arc::ptr_eq(c, &core));
            if current {
                tracing::warn!(core = %name, "Core exited unexpectedly; removing its tools");
                cores.remove(&name);
                core.terminate();
                hub.registry.store(Registry::build(cores.values()));
            }
        });
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.load()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Cancelled when the Hub should stop serving.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the shutdown token after `delay`.
    pub fn request_shutdown(&self, delay: Duration) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    /// Tear down every Core and publish an empty registry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut cores = self.cores.lock().await;
        for core in cores.values() {
            core.terminate();
        }
        let count = cores.len();
        cores.clear();
        self.registry.store(Registry::empty());
        tracing::info!(cores = count, "Hub shut down");
    }
}
