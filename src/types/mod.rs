//! Core types for the Hub.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ConnectionId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Hub configuration and the redacting `Secret` wrapper

mod config;
mod errors;
mod ids;

pub use config::{HubConfig, Secret};
pub use errors::{Error, Result};
pub use ids::ConnectionId;
