//! Configuration structures.
//!
//! Configuration is assembled from CLI flags and environment variables by the
//! `thehub` binary; library users build a [`HubConfig`] directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Hub-wide configuration consumed by the gateway core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Manifest file describing the desired Cores.
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    /// Shared bearer token required by the WebSocket transport.
    #[serde(default)]
    pub token: Option<Secret>,

    /// Per-connection `tools/call` rate in requests per second (0 disables).
    pub rate_limit_rps: u32,

    /// Per-connection cap on concurrently outstanding `tools/call` requests.
    pub max_concurrency_per_client: usize,

    /// Enables the `hub/test/exit` method.
    pub allow_test_shutdown: bool,

    /// Deadline for a forwarded `tools/call`.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Deadline for each handshake step (`initialize`, `tools/list`).
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Quiet period before a burst of manifest edits is reconciled.
    #[serde(with = "humantime_serde")]
    pub reload_debounce: Duration,

    /// Upper bound on a single frame payload.
    pub max_frame_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            manifest_path: None,
            token: None,
            rate_limit_rps: 0,
            max_concurrency_per_client: 4,
            allow_test_shutdown: false,
            call_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            reload_debounce: Duration::from_millis(200),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// A string that never appears in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}
