//! Admission control.
//!
//! Two independent layers:
//! - [`ConcurrencyGate`]: per-Core bound on concurrently forwarded calls.
//!   Waiters queue in FIFO order on the underlying semaphore.
//! - [`ClientSession`]: per-connection token bucket plus an in-flight cap.
//!   Rejections are immediate, never queued.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::kernel::rate_limiter::TokenBucket;
use crate::types::{ConnectionId, Error, HubConfig, Result};

/// Counting gate bounding concurrent calls into one Core.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyGate {
    /// `max` is clamped to at least 1.
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Wait for a slot. The slot is released when the permit drops, on every
    /// exit path of the holder.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::link_closed("concurrency gate closed"))
    }

    /// Stop admitting; queued waiters fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_use(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }
}

/// Proof that a client request passed admission. Holds one in-flight slot.
#[derive(Debug)]
pub struct Admission {
    _slot: OwnedSemaphorePermit,
}

/// Per-connection state shared by all requests on one client connection.
#[derive(Debug)]
pub struct ClientSession {
    id: ConnectionId,
    label: &'static str,
    bucket: Option<Mutex<TokenBucket>>,
    inflight: Arc<Semaphore>,
    max_inflight: usize,
}

impl ClientSession {
    pub fn new(label: &'static str, rate_limit_rps: u32, max_inflight: usize) -> Self {
        let max_inflight = max_inflight.max(1);
        let bucket = (rate_limit_rps > 0).then(|| Mutex::new(TokenBucket::new(rate_limit_rps)));
        Self {
            id: ConnectionId::new(),
            label,
            bucket,
            inflight: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
        }
    }

    pub fn from_config(label: &'static str, config: &HubConfig) -> Self {
        Self::new(label, config.rate_limit_rps, config.max_concurrency_per_client)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Transport label used in logs and metrics (`stdio` or `ws`).
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Check the token bucket, then claim an in-flight slot.
    ///
    /// A rate-limited request does not consume an in-flight slot.
    pub fn admit(&self) -> Result<Admission> {
        if let Some(bucket) = &self.bucket {
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            if !bucket.allow() {
                return Err(Error::RateLimited);
            }
        }
        Arc::clone(&self.inflight)
            .try_acquire_owned()
            .map(|slot| Admission { _slot: slot })
            .map_err(|_| Error::ConcurrencyLimited)
    }

    pub fn in_flight(&self) -> usize {
        self.max_inflight - self.inflight.available_permits()
    }
}
