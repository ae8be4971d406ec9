//! WebSocket transport and the companion HTTP surface.
//!
//! Routes:
//! - `GET /`        WebSocket upgrade, one JSON-RPC message per frame
//! - `GET /healthz` `{"ok":true,"cores":[..],"tools":N,"startedAt":..,"uptimeSecs":N}`
//! - `GET /metrics` Prometheus text

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::ipc::jsonrpc::Incoming;
use crate::ipc::router::{Dispatcher, Routed};
use crate::kernel::admission::ClientSession;
use crate::kernel::Hub;
use crate::types::Result;

/// Subprotocol selected when the client offers it.
pub const SUBPROTOCOL: &str = "mcp";

/// Close code sent when the bearer token does not match.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// HTTP router serving the upgrade endpoint plus health and metrics.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(hub)
}

/// Serve until the Hub's shutdown token is cancelled.
pub async fn serve_ws(hub: Arc<Hub>, listener: TcpListener) -> Result<()> {
    let shutdown = hub.shutdown_token();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("ws_listening on ws://{}", addr);
    }
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn is_authorized(hub: &Hub, headers: &HeaderMap) -> bool {
    let Some(token) = &hub.config().token else {
        return true;
    };
    let expected = format!("Bearer {}", token.expose());
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

async fn ws_upgrade(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let authorized = is_authorized(&hub, &headers);
    ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| async move {
        if authorized {
            handle_socket(hub, socket).await;
        } else {
            reject(socket).await;
        }
    })
}

async fn reject(mut socket: WebSocket) {
    tracing::warn!("Rejecting WebSocket client: bad or missing bearer token");
    let frame = CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: Utf8Bytes::from_static("unauthorized"),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn handle_socket(hub: Arc<Hub>, socket: WebSocket) {
    let session = ClientSession::from_config("ws", hub.config());
    let shutdown = hub.shutdown_token();
    let dispatcher = Dispatcher::new(hub);
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tracing::info!(connection = %session.id(), "ws client connected");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        };

        let parsed = match &message {
            Message::Text(text) => serde_json::from_str::<Incoming>(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice::<Incoming>(bytes),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let incoming = match parsed {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping undecodable client message");
                continue;
            }
        };

        match dispatcher.route(&session, incoming) {
            Routed::Ignored => {}
            Routed::Reply(response) => {
                if let Some(frame) = encode(&response) {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            Routed::Pending(fut) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(frame) = encode(&fut.await) {
                        let _ = tx.send(frame).await;
                    }
                });
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    tracing::info!(connection = %session.id(), "ws client disconnected");
}

fn encode(response: &crate::ipc::jsonrpc::Response) -> Option<Message> {
    match serde_json::to_string(response) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!("Response encoding failed: {}", e);
            None
        }
    }
}

async fn healthz(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    let registry = hub.registry();
    let started_at = hub.started_at();
    let uptime = chrono::Utc::now().signed_duration_since(started_at);
    Json(serde_json::json!({
        "ok": true,
        "cores": registry.core_names(),
        "tools": registry.len(),
        "startedAt": started_at.to_rfc3339(),
        "uptimeSecs": uptime.num_seconds().max(0),
    }))
}

async fn metrics(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        hub.metrics().render(),
    )
}
