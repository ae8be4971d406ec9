//! One supervised Core: child process, RPC link, tool list, concurrency gate.
//!
//! Lifecycle:
//! ```text
//! spawn ──> initialize ──> tools/list ──> Running ──terminate──> Terminating ──> Exited
//!                 │              │            │
//!                 └── fail ──────┴────────────┴── (process exit or link closed) ──> Exited
//! ```
//! A Core that fails its handshake is never constructed; the child is killed on drop.
//! A Core whose link closes counts as exited at once, even while its process
//! is still being stopped.

use serde_json::Value;
use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::link::RpcLink;
use crate::kernel::admission::ConcurrencyGate;
use crate::kernel::registry::ToolDescriptor;
use crate::manifest::CoreConfig;
use crate::observability::redact_env;
use crate::types::{Error, Result};

/// Time a Core gets to exit after SIGTERM before it is killed.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Deadlines applied to a Core's RPC traffic.
#[derive(Debug, Clone, Copy)]
pub struct CoreTimeouts {
    /// Bound on each handshake step.
    pub handshake: Duration,
    /// Bound on each forwarded `tools/call`.
    pub call: Duration,
}

impl Default for CoreTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            call: Duration::from_secs(30),
        }
    }
}

/// A running Core that completed its handshake.
#[derive(Debug)]
pub struct CoreProcess {
    name: String,
    namespace: String,
    config: CoreConfig,
    server_info: Value,
    tools: Vec<ToolDescriptor>,
    link: RpcLink,
    gate: ConcurrencyGate,
    pid: Option<u32>,
    call_timeout: Duration,
    terminate: CancellationToken,
    exited: CancellationToken,
}

impl CoreProcess {
    /// Start the configured command and run the handshake over its stdio.
    pub async fn spawn(name: &str, config: &CoreConfig, timeouts: CoreTimeouts) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        info!(
            core = name,
            command = %config.command,
            args = ?config.args,
            env = ?redact_env(&config.env),
            namespace = config.namespace_for(name),
            "Spawning core"
        );

        let mut child = command
            .spawn()
            .map_err(|e| Error::spawn(name, format!("{}: {}", config.command, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::spawn(name, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn(name, "stdout not captured"))?;

        let link = RpcLink::new(name, stdout, stdin);
        Self::attach(name, config, link, Some(child), timeouts).await
    }

    /// Run the handshake over an existing link.
    ///
    /// Without a child the Core counts as exited once the link closes.
    pub async fn attach(
        name: &str,
        config: &CoreConfig,
        link: RpcLink,
        child: Option<Child>,
        timeouts: CoreTimeouts,
    ) -> Result<Self> {
        let init = link
            .call("initialize", serde_json::json!({}), timeouts.handshake)
            .await
            .map_err(|e| Error::spawn(name, format!("initialize failed: {}", e)))?;
        if !init.is_object() {
            return Err(Error::spawn(
                name,
                Error::protocol("initialize result is not an object").to_string(),
            ));
        }
        let server_info = init.get("serverInfo").cloned().unwrap_or(Value::Null);
        info!(core = name, server_info = %server_info, "Core initialized");

        let listed = link
            .call("tools/list", serde_json::json!({}), timeouts.handshake)
            .await
            .map_err(|e| Error::spawn(name, format!("tools/list failed: {}", e)))?;
        let tools = parse_tools(name, &listed)
            .map_err(|e| Error::spawn(name, format!("tools/list failed: {}", e)))?;

        let namespace = config.namespace_for(name).to_string();
        let pid = child.as_ref().and_then(Child::id);
        let terminate = CancellationToken::new();
        let exited = match child {
            Some(child) => {
                let exited = CancellationToken::new();
                tokio::spawn(supervise_child(
                    name.to_string(),
                    child,
                    terminate.clone(),
                    link.closed_token(),
                    exited.clone(),
                ));
                exited
            }
            None => link.closed_token(),
        };

        info!(core = name, namespace = %namespace, tools = tools.len(), "Tools registered");

        Ok(Self {
            name: name.to_string(),
            namespace,
            config: config.clone(),
            server_info,
            tools,
            link,
            gate: ConcurrencyGate::new(config.max_concurrency()),
            pid,
            call_timeout: timeouts.call,
            terminate,
            exited,
        })
    }

    /// Forward `tools/call` with the bare tool name, holding a gate slot for
    /// the duration of the call.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        let _slot = self.gate.acquire().await?;
        let result = self
            .link
            .call(
                "tools/call",
                serde_json::json!({ "name": tool, "arguments": arguments }),
                self.call_timeout,
            )
            .await?;
        if !result.is_object() {
            return Err(Error::protocol(format!(
                "core '{}' answered tools/call with a non-object result",
                self.name
            )));
        }
        Ok(result)
    }

    /// Begin teardown: signal the process, fail outstanding calls, and stop
    /// admitting new ones. Returns without waiting for the exit.
    pub fn terminate(&self) {
        if self.terminate.is_cancelled() {
            return;
        }
        info!(core = %self.name, pid = ?self.pid, "Stopping core");
        self.terminate.cancel();
        self.gate.close();
        self.link.close();
    }

    /// Resolves once the process (or link, for attached Cores) is gone.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn server_info(&self) -> &Value {
        &self.server_info
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

}

/// Decode a `tools/list` result. Entries without a usable name are skipped;
/// a malformed input schema only warns. A result without a `tools` array is
/// a protocol error.
fn parse_tools(core: &str, listed: &Value) -> Result<Vec<ToolDescriptor>> {
    let Some(raw) = listed.get("tools").and_then(Value::as_array) else {
        return Err(Error::protocol("result has no tools array"));
    };

    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(raw.len());
    for item in raw {
        let tool: ToolDescriptor = match serde_json::from_value(item.clone()) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(core, error = %e, "Skipping malformed tool descriptor");
                continue;
            }
        };
        if tool.name.is_empty() || !seen.insert(tool.name.clone()) {
            warn!(core, tool = %tool.name, "Skipping empty or duplicate tool name");
            continue;
        }
        if let Some(schema) = &tool.input_schema {
            if let Err(e) = jsonschema::validator_for(schema) {
                warn!(core, tool = %tool.name, error = %e, "tool_schema_invalid");
            }
        }
        tools.push(tool);
    }
    Ok(tools)
}

async fn supervise_child(
    name: String,
    mut child: Child,
    terminate: CancellationToken,
    link_closed: CancellationToken,
    exited: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = terminate.cancelled() => {
            stop_child(&name, &mut child).await;
        }
        status = child.wait() => match status {
            Ok(status) => warn!(core = %name, %status, "Core process exited"),
            Err(e) => warn!(core = %name, error = %e, "Failed to wait on core process"),
        },
        _ = link_closed.cancelled() => {
            warn!(core = %name, "Core link closed while the process is running; stopping it");
            exited.cancel();
            stop_child(&name, &mut child).await;
        }
    }
    exited.cancel();
}

/// SIGTERM, then kill once the grace period runs out.
async fn stop_child(name: &str, child: &mut Child) {
    send_sigterm(child);
    match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(core = %name, %status, "Core process stopped"),
        Ok(Err(e)) => warn!(core = %name, error = %e, "Failed to wait on core process"),
        Err(_) => {
            warn!(core = %name, "Core ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(core = %name, error = %e, "Failed to kill core process");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else { return };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            warn!("Failed to send SIGTERM to {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop child: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{FakeCore, FakeCoreMode};
    use tracing_test::traced_test;

    #[test]
    fn parse_tools_skips_bad_entries_and_duplicates() {
        let listed = serde_json::json!({
            "tools": [
                {"name": "say", "description": "Say it", "inputSchema": {"type": "object"}},
                {"name": "say"},
                {"description": "nameless"},
                {"name": "loose", "inputSchema": {"type": 12}},
            ]
        });
        let tools = parse_tools("echo", &listed).unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["say", "loose"]);
    }

    #[traced_test]
    #[test]
    fn invalid_schema_warns_but_keeps_tool() {
        let listed = serde_json::json!({"tools": [{"name": "t", "inputSchema": {"type": 12}}]});
        assert_eq!(parse_tools("c", &listed).unwrap().len(), 1);
        assert!(logs_contain("tool_schema_invalid"));
    }

    #[test]
    fn missing_tools_array_is_a_protocol_error() {
        let err = parse_tools("c", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let err = parse_tools("c", &serde_json::json!({"tools": {"say": {}}})).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn empty_tools_array_is_accepted() {
        assert!(parse_tools("c", &serde_json::json!({"tools": []})).unwrap().is_empty());
    }

    #[tokio::test]
    async fn attach_runs_handshake_and_forwards_calls() {
        let fake = FakeCore::echo("echo", &["say"]).await;
        assert_eq!(fake.core.namespace(), "echo");
        assert_eq!(fake.core.tools().len(), 1);
        assert_eq!(fake.core.server_info()["name"], "fake-core");

        let result = fake
            .core
            .call_tool("say", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "say: hi");
    }

    #[tokio::test]
    async fn failed_initialize_is_a_spawn_error() {
        let err = FakeCore::start_with("broken", &["x"], FakeCoreMode::FailInit)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn peer_exit_fails_pending_calls_with_link_closed() {
        let fake = FakeCore::start_with("m", &["slow"], FakeCoreMode::Manual)
            .await
            .unwrap();
        let core = std::sync::Arc::clone(&fake.core);
        let call = tokio::spawn(async move { core.call_tool("slow", serde_json::json!({})).await });
        fake.wait_for_calls(1).await;
        fake.hang_up();

        let outcome = call.await.unwrap();
        assert!(matches!(outcome, Err(Error::LinkClosed(_))));
        fake.core.exited().await;
        assert!(fake.core.has_exited());
    }

    #[tokio::test]
    async fn terminate_is_immediate_and_fails_new_calls() {
        let fake = FakeCore::echo("echo", &["say"]).await;
        fake.core.terminate();
        assert!(fake.core.is_terminating());
        let result = fake.core.call_tool("say", serde_json::json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_reports_command() {
        let config = CoreConfig::new("/nonexistent/thehub-core-binary");
        let err = CoreProcess::spawn("ghost", &config, CoreTimeouts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn non_object_call_result_is_a_protocol_error() {
        let fake = FakeCore::start_with("bare", &["say"], FakeCoreMode::BareResult)
            .await
            .unwrap();
        let err = fake
            .core
            .call_tool("say", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    /// Completes the handshake, then closes stdout and keeps running.
    #[cfg(unix)]
    const CLOSES_STDOUT: &str = r#"
read -r _
b='{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"sh"}}}'
printf 'Content-Length: %d\r\n\r\n%s' "${#b}" "$b"
read -r _
read -r _
b='{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"t"}]}}'
printf 'Content-Length: %d\r\n\r\n%s' "${#b}" "$b"
exec 1>&-
exec sleep 30
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn closed_link_counts_as_exit_while_process_lives() {
        let mut config = CoreConfig::new("sh");
        config.args = vec!["-c".to_string(), CLOSES_STDOUT.to_string()];
        let core = CoreProcess::spawn("mute", &config, CoreTimeouts::default())
            .await
            .unwrap();
        assert_eq!(core.tools().len(), 1);

        tokio::time::timeout(Duration::from_secs(5), core.exited())
            .await
            .unwrap();
        assert!(core.has_exited());
        assert!(!core.is_terminating());
        let call = core.call_tool("t", serde_json::json!({})).await;
        assert!(matches!(call, Err(Error::LinkClosed(_))));
    }
}
