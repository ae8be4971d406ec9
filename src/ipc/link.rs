//! RpcLink: request/response correlation over a framed duplex byte stream.
//!
//! A reader task decodes frames and resolves pending calls by id; a writer
//! task drains an outbound channel into the stream. When the reader sees EOF
//! (or either task fails) the link closes: every outstanding call resolves to
//! [`Error::LinkClosed`] and later calls fail immediately.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::FrameCodec;
use crate::ipc::jsonrpc::{Incoming, Notification, Request, RpcError};
use crate::types::{Error, Result};

type Waiter = oneshot::Sender<Result<Value>>;

/// Outbound queue depth per link.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Table of outstanding calls. `None` once the link has closed.
#[derive(Debug)]
struct PendingCalls {
    table: Mutex<Option<HashMap<u64, Waiter>>>,
}

impl PendingCalls {
    fn new() -> Self {
        Self {
            table: Mutex::new(Some(HashMap::new())),
        }
    }

    fn register(&self, id: u64) -> Option<oneshot::Receiver<Result<Value>>> {
        let mut guard = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let table = guard.as_mut()?;
        let (tx, rx) = oneshot::channel();
        table.insert(id, tx);
        Some(rx)
    }

    fn remove(&self, id: u64) {
        let mut guard = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = guard.as_mut() {
            table.remove(&id);
        }
    }

    /// Returns false when no call with this id is outstanding.
    fn resolve(&self, id: u64, outcome: Result<Value>) -> bool {
        let waiter = {
            let mut guard = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            guard.as_mut().and_then(|table| table.remove(&id))
        };
        match waiter {
            Some(tx) => {
                // Caller may have given up (timeout); nothing to do.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Close the table and fail every outstanding call.
    fn drain(&self, label: &str) -> usize {
        let drained = {
            let mut guard = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        let Some(table) = drained else { return 0 };
        let count = table.len();
        for (_, tx) in table {
            let _ = tx.send(Err(Error::link_closed(label)));
        }
        count
    }

    fn len(&self) -> usize {
        let guard = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map_or(0, HashMap::len)
    }
}

/// Future for one outstanding request, resolved by the reader task.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    label: Arc<str>,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::link_closed(self.label.as_ref()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bidirectional JSON-RPC channel to one peer.
#[derive(Debug)]
pub struct RpcLink {
    label: Arc<str>,
    next_id: AtomicU64,
    write_tx: mpsc::Sender<Bytes>,
    pending: Arc<PendingCalls>,
    closed: CancellationToken,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl RpcLink {
    /// Start reader/writer tasks over the given stream halves.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label: Arc<str> = Arc::from(label.into());
        let pending = Arc::new(PendingCalls::new());
        let closed = CancellationToken::new();
        let (write_tx, write_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);

        let writer_handle = tokio::spawn(write_loop(
            Arc::clone(&label),
            writer,
            write_rx,
            Arc::clone(&pending),
            closed.clone(),
        ));
        let reader_handle = tokio::spawn(read_loop(
            Arc::clone(&label),
            reader,
            Arc::clone(&pending),
            closed.clone(),
        ));

        Self {
            label,
            next_id: AtomicU64::new(1),
            write_tx,
            pending,
            closed,
            reader_handle,
            writer_handle,
        }
    }

    /// Write a request and return a future for its response.
    ///
    /// Ids are assigned sequentially from 1 and never reused on this link.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<PendingCall> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&Request::new(id, method, params))?;

        let rx = self
            .pending
            .register(id)
            .ok_or_else(|| Error::link_closed(self.label.as_ref()))?;

        if self.write_tx.send(Bytes::from(payload)).await.is_err() {
            self.pending.remove(id);
            return Err(Error::link_closed(self.label.as_ref()));
        }

        Ok(PendingCall {
            id,
            label: Arc::clone(&self.label),
            rx,
        })
    }

    /// Send a request and wait for its response, bounded by `deadline`.
    pub async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let pending = self.send_request(method, params).await?;
        let id = pending.id();
        match tokio::time::timeout(deadline, pending).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                self.pending.remove(id);
                Err(Error::timeout(format!(
                    "{} on '{}' after {}ms",
                    method,
                    self.label,
                    deadline.as_millis()
                )))
            }
        }
    }

    /// Send a notification (fire-and-forget).
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let payload = serde_json::to_vec(&Notification::new(method, params))?;
        self.write_tx
            .send(Bytes::from(payload))
            .await
            .map_err(|_| Error::link_closed(self.label.as_ref()))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link has closed and its pending calls were drained.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Token cancelled when the link closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop both tasks and fail all outstanding calls.
    pub fn close(&self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        let drained = self.pending.drain(&self.label);
        if drained > 0 {
            tracing::debug!(link = %self.label, drained, "Failed pending calls on close");
        }
        self.closed.cancel();
    }
}

impl Drop for RpcLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(
    label: Arc<str>,
    reader: R,
    pending: Arc<PendingCalls>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new());

    while let Some(frame) = frames.next().await {
        let payload = match frame {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(link = %label, error = %e, "Link read failed");
                break;
            }
        };

        let message: Incoming = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(link = %label, error = %e, "Dropping undecodable payload");
                continue;
            }
        };

        let Some(id) = message.response_id() else {
            tracing::debug!(link = %label, method = ?message.method, "Ignoring peer-initiated message");
            continue;
        };

        let outcome = match message.error {
            Some(err) => Err(Error::Backend(RpcError::from_value(&err))),
            None => Ok(message.result.unwrap_or(Value::Null)),
        };
        if !pending.resolve(id, outcome) {
            tracing::debug!(link = %label, id, "Response for unknown id ignored");
        }
    }

    let drained = pending.drain(&label);
    tracing::debug!(link = %label, drained, "Link reader finished");
    closed.cancel();
}

async fn write_loop<W>(
    label: Arc<str>,
    writer: W,
    mut write_rx: mpsc::Receiver<Bytes>,
    pending: Arc<PendingCalls>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            next = write_rx.recv() => {
                let Some(payload) = next else { break };
                if let Err(e) = sink.send(payload).await {
                    tracing::warn!(link = %label, error = %e, "Link write failed");
                    pending.drain(&label);
                    closed.cancel();
                    break;
                }
            }
        }
    }
}
