//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant maps onto a JSON-RPC error object via [`Error::to_rpc_error`], which
//! is the only shape clients ever see.

use thiserror::Error;

use crate::ipc::jsonrpc::{codes, RpcError};

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the Hub.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing manifest/configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A Core failed to start or failed its handshake.
    #[error("failed to start core '{core}': {reason}")]
    Spawn { core: String, reason: String },

    /// A peer answered with a message of the wrong shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `tools/call` named a tool that is not in the registry.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Method name not routed by the Hub.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Per-connection token bucket is empty.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Per-connection in-flight cap reached.
    #[error("too many concurrent requests")]
    ConcurrencyLimited,

    /// Gated operation not enabled.
    #[error("{0}")]
    Forbidden(String),

    /// Error object returned by a Core, propagated verbatim.
    #[error("backend error {}: {}", .0.code, .0.message)]
    Backend(RpcError),

    /// The link to a Core terminated while the call was outstanding.
    #[error("link closed: {0}")]
    LinkClosed(String),

    /// A Core did not answer within its deadline.
    #[error("backend timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Manifest YAML errors.
    #[error("manifest parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to the JSON-RPC error object returned to clients.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Error::UnknownTool(_) | Error::MethodNotFound(_) => {
                RpcError::new(codes::METHOD_NOT_FOUND, self.to_string())
            }
            Error::RateLimited | Error::ConcurrencyLimited => {
                RpcError::new(codes::TOO_MANY_REQUESTS, self.to_string())
            }
            Error::Forbidden(msg) => RpcError::new(codes::FORBIDDEN, msg.clone()),
            Error::Backend(remote) => remote.clone(),
            Error::LinkClosed(_) => RpcError::new(codes::LINK_CLOSED, self.to_string()),
            Error::Timeout(_) => RpcError::new(codes::BACKEND_TIMEOUT, self.to_string()),
            Error::Config(_)
            | Error::Spawn { .. }
            | Error::Protocol(_)
            | Error::Serialization(_)
            | Error::Yaml(_)
            | Error::Io(_) => RpcError::new(codes::INTERNAL_ERROR, self.to_string()),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn spawn(core: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            core: core.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::UnknownTool(name.into())
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound(method.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn link_closed(link: impl Into<String>) -> Self {
        Self::LinkClosed(link.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
