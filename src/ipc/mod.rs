//! Wire layer: framing, JSON-RPC envelopes, Core links, and client transports.
//!
//! The same `Content-Length` framing carries both the stdio client transport
//! and every Hub-to-Core link. WebSocket clients send one JSON message per
//! frame instead.

pub mod codec;
pub mod jsonrpc;
pub mod link;
pub mod router;
pub mod stdio;
pub mod ws;

pub use codec::FrameCodec;
pub use link::RpcLink;
pub use router::{Dispatcher, Routed};
pub use stdio::{serve_framed, serve_stdio};
pub use ws::serve_ws;
