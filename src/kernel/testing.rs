//! In-memory Cores for unit tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::FrameCodec;
use crate::ipc::jsonrpc::{Incoming, Response, RpcError};
use crate::ipc::link::RpcLink;
use crate::kernel::core_process::{CoreProcess, CoreTimeouts};
use crate::kernel::reconciler::Supervisor;
use crate::manifest::CoreConfig;
use crate::types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeCoreMode {
    /// Answers `tools/call` immediately with `<tool>: <text>`.
    Echo,
    /// Holds every `tools/call` until [`FakeHandle::release_one`].
    Manual,
    /// Rejects `initialize`.
    FailInit,
    /// Answers `tools/call` with a bare string instead of an object.
    BareResult,
}

#[derive(Debug)]
pub(crate) struct FakeCore {
    pub core: Arc<CoreProcess>,
    calls: watch::Receiver<usize>,
    release_tx: mpsc::UnboundedSender<()>,
    hangup: CancellationToken,
    mute: CancellationToken,
}

impl FakeCore {
    /// Echo Core named and namespaced `name`.
    pub async fn echo(name: &str, tools: &[&str]) -> Self {
        match Self::start_with(name, tools, FakeCoreMode::Echo).await {
            Ok(fake) => fake,
            Err(e) => panic!("fake core failed to start: {e}"),
        }
    }

    pub async fn start_with(name: &str, tools: &[&str], mode: FakeCoreMode) -> Result<Self> {
        Self::start_config(name, &CoreConfig::new("fake"), tools, mode).await
    }

    pub async fn start_config(
        name: &str,
        config: &CoreConfig,
        tools: &[&str],
        mode: FakeCoreMode,
    ) -> Result<Self> {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (calls_tx, calls) = watch::channel(0usize);
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let hangup = CancellationToken::new();
        let mute = CancellationToken::new();

        tokio::spawn(serve_fake(
            theirs,
            tools.iter().map(|t| t.to_string()).collect(),
            mode,
            calls_tx,
            release_rx,
            hangup.clone(),
            mute.clone(),
        ));

        let (r, w) = tokio::io::split(ours);
        let link = RpcLink::new(name, r, w);
        let core = CoreProcess::attach(name, config, link, None, CoreTimeouts::default()).await?;
        Ok(Self {
            core: Arc::new(core),
            calls,
            release_tx,
            hangup,
            mute,
        })
    }

    pub async fn wait_for_calls(&self, n: usize) {
        let mut calls = self.calls.clone();
        let _ = calls.wait_for(|seen| *seen >= n).await;
    }

    /// Drop the Core's end of the pipe, as if the process died.
    pub fn hang_up(&self) {
        self.hangup.cancel();
    }
}

fn text_result(text: String) -> Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false,
    })
}

async fn serve_fake(
    stream: DuplexStream,
    tools: Vec<String>,
    mode: FakeCoreMode,
    calls_tx: watch::Sender<usize>,
    mut release_rx: mpsc::UnboundedReceiver<()>,
    hangup: CancellationToken,
    mute: CancellationToken,
) {
    let (r, w) = tokio::io::split(stream);
    let mut frames = FramedRead::new(r, FrameCodec::new());
    let mut sink = Some(FramedWrite::new(w, FrameCodec::new()));
    let mut held: VecDeque<Value> = VecDeque::new();

    loop {
        let reply = tokio::select! {
            _ = hangup.cancelled() => break,
            _ = mute.cancelled(), if sink.is_some() => {
                if let Some(mut closing) = sink.take() {
                    let _ = SinkExt::<Vec<u8>>::close(&mut closing).await;
                }
                None
            }
            Some(()) = release_rx.recv() => match held.pop_front() {
                Some(id) => Some(Response::success(id, text_result("released".to_string()))),
                None => None,
            },
            frame = frames.next() => {
                let Some(Ok(payload)) = frame else { break };
                let Ok(msg) = serde_json::from_slice::<Incoming>(&payload) else { continue };
                let id = msg.id.clone().unwrap_or(Value::Null);
                let params = msg.params.unwrap_or(Value::Null);
                match msg.method.as_deref() {
                    Some("initialize") if mode == FakeCoreMode::FailInit => {
                        Some(Response::failure(id, RpcError::new(-32603, "init refused")))
                    }
                    Some("initialize") => Some(Response::success(
                        id,
                        serde_json::json!({"serverInfo": {"name": "fake-core"}, "capabilities": {}}),
                    )),
                    Some("tools/list") => {
                        let listed: Vec<Value> = tools
                            .iter()
                            .map(|name| serde_json::json!({"name": name, "description": "", "inputSchema": {"type": "object"}}))
                            .collect();
                        Some(Response::success(id, serde_json::json!({ "tools": listed })))
                    }
                    Some("tools/call") => {
                        calls_tx.send_modify(|seen| *seen += 1);
                        if mode == FakeCoreMode::Manual {
                            held.push_back(id);
                            None
                        } else if mode == FakeCoreMode::BareResult {
                            Some(Response::success(id, Value::String("bare".to_string())))
                        } else {
                            let tool = params["name"].as_str().unwrap_or_default().to_string();
                            let text = params["arguments"]["text"].as_str().unwrap_or_default();
                            Some(Response::success(id, text_result(format!("{tool}: {text}"))))
                        }
                    }
                    _ => Some(Response::failure(id, RpcError::new(-32601, "unknown"))),
                }
            }
        };
        if let (Some(reply), Some(out)) = (reply, sink.as_mut()) {
            let Ok(bytes) = serde_json::to_vec(&reply) else { break };
            if out.send(bytes).await.is_err() {
                break;
            }
        }
    }
}

/// Supervisor that starts [`FakeCore`]s and counts starts per Core name.
///
/// The command picks the mode (`manual`, `fail`, anything else echoes) and
/// the args list the advertised tools.
#[derive(Debug, Default)]
pub(crate) struct FakeSupervisor {
    starts: Mutex<BTreeMap<String, usize>>,
    fakes: Mutex<Vec<FakeCore>>,
}

impl FakeSupervisor {
    pub fn starts(&self, name: &str) -> usize {
        self.starts.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Most recently started fake for `name`.
    pub fn latest(&self, name: &str) -> Option<FakeHandle> {
        let fakes = self.fakes.lock().unwrap();
        fakes
            .iter()
            .rev()
            .find(|f| f.core.name() == name)
            .map(|f| FakeHandle {
                core: Arc::clone(&f.core),
                calls: f.calls.clone(),
                release_tx: f.release_tx.clone(),
                hangup: f.hangup.clone(),
                mute: f.mute.clone(),
            })
    }
}

/// Cloned controls for a fake owned by a [`FakeSupervisor`].
#[derive(Debug)]
pub(crate) struct FakeHandle {
    pub core: Arc<CoreProcess>,
    calls: watch::Receiver<usize>,
    release_tx: mpsc::UnboundedSender<()>,
    hangup: CancellationToken,
    mute: CancellationToken,
}

impl FakeHandle {
    pub fn calls_seen(&self) -> usize {
        *self.calls.borrow()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        let mut calls = self.calls.clone();
        let _ = calls.wait_for(|seen| *seen >= n).await;
    }

    pub fn release_one(&self) {
        let _ = self.release_tx.send(());
    }

    pub fn hang_up(&self) {
        self.hangup.cancel();
    }

    /// Close the Core's output but keep reading, as if it shut its stdout.
    pub fn close_output(&self) {
        self.mute.cancel();
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn start(&self, name: &str, config: &CoreConfig) -> Result<Arc<CoreProcess>> {
        *self.starts.lock().unwrap().entry(name.to_string()).or_insert(0) += 1;
        let mode = match config.command.as_str() {
            "manual" => FakeCoreMode::Manual,
            "fail" => FakeCoreMode::FailInit,
            _ => FakeCoreMode::Echo,
        };
        let tools: Vec<&str> = config.args.iter().map(String::as_str).collect();
        let fake = FakeCore::start_config(name, config, &tools, mode).await?;
        let core = Arc::clone(&fake.core);
        self.fakes.lock().unwrap().push(fake);
        Ok(core)
    }
}
