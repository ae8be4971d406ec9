//! Client request routing.
//!
//! Only `tools/call` reaches a Core; every other method is answered inline.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::ipc::jsonrpc::{Incoming, Response};
use crate::kernel::admission::ClientSession;
use crate::kernel::registry::split_namespaced;
use crate::kernel::{Hub, TEST_EXIT_DELAY};
use crate::metrics::RequestLabels;
use crate::types::{Error, Result};

/// Outcome of routing one client message.
#[allow(missing_debug_implementations)]
pub enum Routed {
    /// Not a request (notification or stray response); nothing to send.
    Ignored,
    /// Answer available immediately.
    Reply(Response),
    /// Answer arrives when the forwarded call completes.
    Pending(BoxFuture<'static, Response>),
}

/// Routes client requests against a Hub.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    hub: Arc<Hub>,
}

impl Dispatcher {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Route one decoded message from `session`.
    pub fn route(&self, session: &ClientSession, message: Incoming) -> Routed {
        let Some(method) = message.method else {
            return Routed::Ignored;
        };
        let Some(id) = message.id else {
            tracing::debug!(client = session.label(), method = %method, "Ignoring client notification");
            return Routed::Ignored;
        };
        let params = message.params.unwrap_or(Value::Null);

        let outcome = match method.as_str() {
            "initialize" => Ok(initialize_result()),
            "ping" => Ok(serde_json::json!({ "ok": true })),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => return self.call_tool(session, id, params),
            "hub/test/exit" => self.test_exit(),
            other => Err(Error::method_not_found(other)),
        };
        Routed::Reply(into_response(id, outcome))
    }

    fn list_tools(&self) -> Value {
        serde_json::json!({ "tools": self.hub.registry().list_tools() })
    }

    fn test_exit(&self) -> Result<Value> {
        if !self.hub.config().allow_test_shutdown {
            return Err(Error::forbidden("test shutdown not allowed"));
        }
        tracing::info!("Test shutdown requested");
        self.hub.request_shutdown(TEST_EXIT_DELAY);
        Ok(serde_json::json!({ "ok": true }))
    }

    fn call_tool(&self, session: &ClientSession, id: Value, params: Value) -> Routed {
        let full = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let registry = self.hub.registry();
        let Some(entry) = registry.get(&full).cloned() else {
            return Routed::Reply(into_response(id, Err(Error::unknown_tool(full))));
        };

        let admission = match session.admit() {
            Ok(admission) => admission,
            Err(e) => {
                tracing::debug!(client = session.label(), tool = %full, error = %e, "Call rejected");
                return Routed::Reply(into_response(id, Err(e)));
            }
        };

        let bare = split_namespaced(&full)
            .map(|(_, tool)| tool.to_string())
            .unwrap_or_else(|| full.clone());
        let arguments = match params.get("arguments") {
            Some(args) if !args.is_null() => args.clone(),
            _ => serde_json::json!({}),
        };
        let labels = RequestLabels::new(session.label(), "tools/call", entry.namespace());
        let hub = Arc::clone(&self.hub);

        Routed::Pending(
            async move {
                let _admission = admission;
                let started = Instant::now();
                let outcome = entry.core.call_tool(&bare, arguments).await;
                match &outcome {
                    Ok(_) => hub.metrics().record_success(labels, started.elapsed()),
                    Err(e) => {
                        tracing::debug!(tool = %full, error = %e, "Forwarded call failed");
                        hub.metrics().record_error(labels);
                    }
                }
                into_response(id, outcome)
            }
            .boxed(),
        )
    }
}

fn initialize_result() -> Value {
    serde_json::json!({
        "serverInfo": { "name": "thehub", "version": env!("CARGO_PKG_VERSION") },
        "capabilities": { "tools": { "listChangedNotification": true } },
    })
}

fn into_response(id: Value, outcome: Result<Value>) -> Response {
    match outcome {
        Ok(result) => Response::success(id, result),
        Err(e) => Response::failure(id, e.to_rpc_error()),
    }
}
