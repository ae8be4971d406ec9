//! Manifest reconciliation.
//!
//! Diffs the desired Core set against the running one and converges:
//! removed Cores are torn down, new Cores are started, and Cores whose launch
//! configuration or effective namespace changed are torn down and started
//! fresh. A Core is never mutated in place.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::kernel::core_process::{CoreProcess, CoreTimeouts};
use crate::manifest::{CoreConfig, Manifest};
use crate::types::Result;

/// Starts Cores. The production implementation spawns processes; tests
/// substitute in-memory Cores.
#[async_trait]
pub trait Supervisor: Send + Sync + std::fmt::Debug {
    async fn start(&self, name: &str, config: &CoreConfig) -> Result<Arc<CoreProcess>>;
}

/// Spawns each Core as a child process speaking over its stdio.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    timeouts: CoreTimeouts,
}

impl ProcessSupervisor {
    pub fn new(timeouts: CoreTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self, name: &str, config: &CoreConfig) -> Result<Arc<CoreProcess>> {
        CoreProcess::spawn(name, config, self.timeouts).await.map(Arc::new)
    }
}

/// Actions needed to converge the running set onto a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub remove: Vec<String>,
    pub add: Vec<String>,
    pub restart: Vec<String>,
}

impl ReconcilePlan {
    /// Compare desired configs against the configs of running Cores.
    pub fn compute(desired: &Manifest, current: &BTreeMap<String, CoreConfig>) -> Self {
        let mut plan = Self::default();
        for name in current.keys() {
            if !desired.cores.contains_key(name) {
                plan.remove.push(name.clone());
            }
        }
        for (name, wanted) in &desired.cores {
            match current.get(name) {
                None => plan.add.push(name.clone()),
                Some(running) => {
                    let changed = !running.same_launch(wanted)
                        || running.namespace_for(name) != wanted.namespace_for(name);
                    if changed {
                        plan.restart.push(name.clone());
                    }
                }
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty() && self.restart.is_empty()
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    /// Cores that failed to start; they are absent from the running set.
    pub failed: Vec<String>,
}

/// Applies manifests to a running Core set using a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct Reconciler {
    supervisor: Arc<dyn Supervisor>,
}

impl Reconciler {
    pub fn new(supervisor: Arc<dyn Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Converge `cores` onto `desired`.
    ///
    /// The manifest is validated first; an invalid manifest returns the
    /// error with `cores` untouched. Start failures are reported, not raised.
    pub async fn apply(
        &self,
        desired: &Manifest,
        cores: &mut BTreeMap<String, Arc<CoreProcess>>,
    ) -> Result<ReconcileReport> {
        desired.validate()?;

        let current: BTreeMap<String, CoreConfig> = cores
            .iter()
            .map(|(name, core)| (name.clone(), core.config().clone()))
            .collect();
        let plan = ReconcilePlan::compute(desired, &current);
        if plan.is_empty() {
            return Ok(ReconcileReport::default());
        }

        for name in plan.remove.iter().chain(plan.restart.iter()) {
            if let Some(core) = cores.remove(name) {
                core.terminate();
            }
        }

        let to_start: Vec<&String> = plan.add.iter().chain(plan.restart.iter()).collect();
        let started = futures::future::join_all(to_start.iter().map(|name| {
            let config = &desired.cores[name.as_str()];
            self.supervisor.start(name, config)
        }))
        .await;

        let mut report = ReconcileReport {
            removed: plan.remove.clone(),
            ..ReconcileReport::default()
        };
        for (name, outcome) in to_start.into_iter().zip(started) {
            match outcome {
                Ok(core) => {
                    cores.insert(name.clone(), core);
                    if plan.restart.contains(name) {
                        report.restarted.push(name.clone());
                    } else {
                        report.added.push(name.clone());
                    }
                }
                Err(e) => {
                    error!(core = %name, error = %e, "Core failed to start");
                    report.failed.push(name.clone());
                }
            }
        }

        info!(
            added = ?report.added,
            removed = ?report.removed,
            restarted = ?report.restarted,
            failed = ?report.failed,
            "Reconciliation applied"
        );
        Ok(report)
    }
}
