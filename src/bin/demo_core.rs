//! demo-core - a minimal Core for demos and integration tests.
//!
//! Speaks Content-Length framed JSON-RPC on stdin/stdout and exposes one
//! text tool plus `sleep`.

use clap::{Parser, ValueEnum};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use thehub::ipc::codec::FrameCodec;
use thehub::ipc::jsonrpc::{codes, Incoming, Response, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ToolKind {
    /// `say` answers `echo: <text>`.
    Say,
    /// `echo` answers `<text>` unchanged.
    Echo,
}

impl ToolKind {
    fn name(self) -> &'static str {
        match self {
            ToolKind::Say => "say",
            ToolKind::Echo => "echo",
        }
    }

    fn render(self, text: &str) -> String {
        match self {
            ToolKind::Say => format!("echo: {}", text),
            ToolKind::Echo => text.to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "demo-core", about = "Demo Core speaking the Hub protocol over stdio")]
struct Args {
    /// Which text tool to expose.
    #[arg(long, value_enum, default_value = "say")]
    tool: ToolKind,

    /// Server name reported by initialize.
    #[arg(long, default_value = "demo-core")]
    name: String,

    /// Answer initialize with an error.
    #[arg(long)]
    fail_init: bool,

    /// Exit without answering on the first tools/call.
    #[arg(long)]
    exit_on_call: bool,
}

#[tokio::main]
async fn main() {
    thehub::observability::init_tracing();
    let args = Args::parse();

    let (tx, mut rx) = mpsc::channel::<Response>(64);
    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(tokio::io::stdout(), FrameCodec::new());
        while let Some(response) = rx.recv().await {
            let Ok(bytes) = serde_json::to_vec(&response) else { continue };
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FramedRead::new(tokio::io::stdin(), FrameCodec::new());
    while let Some(Ok(payload)) = frames.next().await {
        let Ok(message) = serde_json::from_slice::<Incoming>(&payload) else {
            continue;
        };
        let (Some(method), Some(id)) = (message.method, message.id) else {
            continue;
        };
        let params = message.params.unwrap_or(Value::Null);

        let response = match method.as_str() {
            "initialize" if args.fail_init => Response::failure(
                id,
                RpcError::new(codes::INTERNAL_ERROR, "initialization refused"),
            ),
            "initialize" => Response::success(
                id,
                serde_json::json!({
                    "serverInfo": { "name": args.name.as_str(), "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": {} },
                }),
            ),
            "ping" => Response::success(id, serde_json::json!({ "ok": true })),
            "tools/list" => Response::success(id, tool_list(args.tool)),
            "tools/call" => {
                if args.exit_on_call {
                    tracing::warn!("Exiting on tools/call as requested");
                    std::process::exit(3);
                }
                let tx = tx.clone();
                let kind = args.tool;
                tokio::spawn(async move {
                    let _ = tx.send(call_tool(kind, id, &params).await).await;
                });
                continue;
            }
            other => Response::failure(
                id,
                RpcError::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", other)),
            ),
        };
        if tx.send(response).await.is_err() {
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
    std::process::exit(0);
}

fn tool_list(kind: ToolKind) -> Value {
    serde_json::json!({
        "tools": [
            {
                "name": kind.name(),
                "description": format!("Return {}", kind.render("<text>")),
                "inputSchema": {
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"],
                },
            },
            {
                "name": "sleep",
                "description": "Wait for ms milliseconds",
                "inputSchema": {
                    "type": "object",
                    "properties": { "ms": { "type": "integer", "minimum": 0 } },
                },
            },
        ]
    })
}

fn text_content(text: String) -> Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false,
    })
}

async fn call_tool(kind: ToolKind, id: Value, params: &Value) -> Response {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

    if name == kind.name() {
        let text = arguments.get("text").and_then(Value::as_str).unwrap_or_default();
        return Response::success(id, text_content(kind.render(text)));
    }
    if name == "sleep" {
        let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        return Response::success(id, text_content(format!("slept {}", ms)));
    }
    Response::failure(
        id,
        RpcError::new(codes::METHOD_NOT_FOUND, format!("Unknown tool: {}", name)),
    )
}
