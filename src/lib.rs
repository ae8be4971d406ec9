//! # TheHub - Tool Gateway over Supervised Cores
//!
//! Aggregates tool-providing backend processes ("Cores") behind one
//! namespaced JSON-RPC surface:
//! - Content-Length framed JSON-RPC over stdio, plus a WebSocket transport
//! - Manifest-driven Core supervision with hot reconciliation
//! - Namespaced tool registry rebuilt atomically per reconciliation
//! - Per-Core concurrency gates and per-connection rate limiting
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────────────────┐
//!   stdio / ws  ───>  │            Hub                   │
//!   clients           │  ┌──────────┐   ┌────────────┐   │
//!                     │  │Dispatcher│──>│  Registry  │   │
//!                     │  └────┬─────┘   └────────────┘   │
//!                     │       │ admission + gate         │
//!                     │  ┌────v─────┐   ┌────────────┐   │
//!                     │  │ RpcLink  │<──│ Reconciler │<──── manifest
//!                     │  └────┬─────┘   └────────────┘   │
//!                     └───────┼──────────────────────────┘
//!                             v
//!                        Core processes
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod ipc;
pub mod kernel;
pub mod manifest;
pub mod metrics;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::Hub;
pub use manifest::{CoreConfig, Manifest};
pub use types::{Error, HubConfig, Result};
