//! Length-framed stdio transport.
//!
//! One client session per stream. Requests are routed in arrival order;
//! responses to forwarded calls are written as they complete.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::ipc::codec::FrameCodec;
use crate::ipc::jsonrpc::{Incoming, Response};
use crate::ipc::router::{Dispatcher, Routed};
use crate::kernel::admission::ClientSession;
use crate::kernel::Hub;
use crate::types::Result;

/// Outbound response queue depth.
const RESPONSE_QUEUE_DEPTH: usize = 64;

/// Serve the process's own stdin/stdout until EOF or shutdown.
pub async fn serve_stdio(hub: Arc<Hub>) -> Result<()> {
    serve_framed(hub, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one framed client over arbitrary stream halves.
pub async fn serve_framed<R, W>(hub: Arc<Hub>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = ClientSession::from_config("stdio", hub.config());
    let max_frame_bytes = hub.config().max_frame_bytes;
    let shutdown = hub.shutdown_token();
    let dispatcher = Dispatcher::new(hub);

    let (tx, rx) = mpsc::channel::<Response>(RESPONSE_QUEUE_DEPTH);
    let writer_task = tokio::spawn(write_responses(writer, rx));
    let mut frames = FramedRead::new(reader, FrameCodec::with_max_frame_bytes(max_frame_bytes));

    tracing::info!(connection = %session.id(), "stdio client attached");

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let payload = match frame {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "stdio read failed");
                break;
            }
            None => {
                tracing::info!("stdio input closed");
                break;
            }
        };

        let message: Incoming = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping undecodable client payload");
                continue;
            }
        };

        match dispatcher.route(&session, message) {
            Routed::Ignored => {}
            Routed::Reply(response) => {
                if tx.send(response).await.is_err() {
                    break;
                }
            }
            Routed::Pending(fut) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(fut.await).await;
                });
            }
        }
    }

    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

async fn write_responses<W>(writer: W, mut rx: mpsc::Receiver<Response>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());
    while let Some(response) = rx.recv().await {
        let bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Response encoding failed: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(bytes).await {
            tracing::warn!(error = %e, "stdio write failed");
            break;
        }
    }
}
