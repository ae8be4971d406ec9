//! Manifest file watcher.
//!
//! Raw filesystem events go through a [`Debouncer`], which emits one tick per
//! burst once the quiet period elapses with no further events. Consumers
//! reload and reconcile on each tick; reconciliation itself never depends on
//! the watcher and can be invoked directly.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{Error, Result};

/// Collapses bursts of triggers into a single tick after a quiet period.
#[derive(Debug)]
pub struct Debouncer {
    trigger_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// Start the debounce loop. Ticks arrive on the returned receiver; a tick
    /// that is not consumed yet absorbs later ones.
    pub fn new(quiet: Duration) -> (Self, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let task = tokio::spawn(debounce_loop(quiet, trigger_rx, tick_tx));
        (Self { trigger_tx, task }, tick_rx)
    }

    /// Record one raw event. Callable from any thread.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }

    pub fn handle(&self) -> DebounceHandle {
        DebounceHandle {
            trigger_tx: self.trigger_tx.clone(),
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cloneable trigger side of a [`Debouncer`].
#[derive(Debug, Clone)]
pub struct DebounceHandle {
    trigger_tx: mpsc::UnboundedSender<()>,
}

impl DebounceHandle {
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }
}

async fn debounce_loop(
    quiet: Duration,
    mut triggers: mpsc::UnboundedReceiver<()>,
    ticks: mpsc::Sender<()>,
) {
    while triggers.recv().await.is_some() {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(quiet) => break,
                next = triggers.recv() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }
        if let Err(mpsc::error::TrySendError::Closed(())) = ticks.try_send(()) {
            return;
        }
    }
}

/// Watches one manifest file and emits debounced change ticks.
pub struct ManifestWatcher {
    _watcher: RecommendedWatcher,
    _debouncer: Debouncer,
    path: PathBuf,
}

impl std::fmt::Debug for ManifestWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ManifestWatcher {
    /// Watch `path`. The parent directory is watched so editors that replace
    /// the file by rename are still observed.
    pub fn new(path: &Path, quiet: Duration) -> Result<(Self, mpsc::Receiver<()>)> {
        let (debouncer, ticks) = Debouncer::new(quiet);
        let handle = debouncer.handle();

        let file_name: Option<OsString> = path.file_name().map(|n| n.to_os_string());
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        debug!("Manifest change event: {:?}", event.kind);
                        handle.trigger();
                    }
                }
                Err(e) => warn!("Manifest watch error: {}", e),
            }
        })
        .map_err(|e| Error::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::config(format!("Failed to watch {}: {}", dir.display(), e)))?;

        info!("Watching manifest at {}", path.display());

        Ok((
            Self {
                _watcher: watcher,
                _debouncer: debouncer,
                path: path.to_path_buf(),
            },
            ticks,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
