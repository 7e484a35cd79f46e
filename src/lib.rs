//! # Mill-TCP
//! A framed TCP connection backend built on [`mio`] and [`socket2`], without an async runtime.
//!
//! Mill-TCP accepts and establishes TCP connections and exchanges length-framed messages over
//! them. Every message starts with a fixed-size header; a user supplied [`FrameHandler`] looks at
//! the header and hands back the buffer for the body that follows. Receiving runs either on one
//! thread per connection or on a small reactor ([`mio`] poll thread plus worker pool). Sending is
//! synchronous and serialized per connection.
//! ## Features
//! - **Framed receive**: header up to [`MAX_HEADER_SIZE`] bytes, body sized by the callback
//! - **Two receive models**: thread per connection, or a shared reactor with N workers
//! - **Exactly-once disconnect**: the disconnect handler fires once per connection, even when it
//!   is registered after the connection died
//! - **Listen on every interface**: an empty bind address listens on all local IPv4 addresses
//! - **Pluggable logging**: a [`Logger`] trait with a [`tracing`] backed default
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ TcpBackend  │───▶│ Connections  │───▶│ recv thread  │  reactor_workers == 0
//! └─────────────┘    └──────────────┘    └──────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ ListenEntry │    │   Reactor    │───▶│ ThreadPool  │  reactor_workers > 0
//! └─────────────┘    └──────────────┘    └─────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mill_tcp::prelude::*;
//!
//! struct Frames;
//!
//! impl FrameHandler for Frames {
//!     fn on_header(&self, _id: ConnectionId, header: &[u8]) -> HeaderAction {
//!         let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
//!         HeaderAction::Body(vec![0; len as usize])
//!     }
//!
//!     fn on_body(&self, _id: ConnectionId, _header: &[u8], body: Vec<u8>, _failed: bool) -> bool {
//!         println!("Received {} bytes", body.len());
//!         true
//!     }
//! }
//!
//! fn main() -> mill_tcp::error::Result<()> {
//!     let server = TcpBackend::new(TcpBackendConfig::default())?;
//!     server.start_listen(1345, "127.0.0.1", |ctx, id, _peer| {
//!         ctx.set_recv_callbacks(id, 4, Arc::new(Frames), "server").is_ok()
//!     })?;
//!
//!     let client = TcpBackend::new(TcpBackendConfig::default())?;
//!     let id = client.connect("127.0.0.1", 1345, |_ctx, _id, _peer| true)?;
//!     let mut frame = 5u32.to_le_bytes().to_vec();
//!     frame.extend_from_slice(b"hello");
//!     client.send(id, &frame, "client")?;
//!     Ok(())
//! }
//! ```
//!
//! - [`TcpBackend`]: owner of listeners and connections
//! - [`BackendContext`]: cloneable handle passed to callbacks
//! - [`reactor`]: poll thread used by the reactor receive model
//! - [`thread_pool`]: worker pool for the reactor
//! - [`poll`]: handler registry and single socket readiness waits
//! - [`error`]: error types and result handling

pub mod error;
pub mod event;
pub mod handler;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod signal;
pub mod thread_pool;

pub use error::{NetworkError, SendError};
pub use handler::EventHandler;
pub use net::tcp::traits::{
    ConnectionId, DataSentHandler, DisconnectHandler, DisconnectReason, FrameHandler,
    HeaderAction, LogLevel, Logger, NoOpLogger, RecvTimeoutHandler, TracingLogger,
};
pub use net::tcp::{BackendContext, TcpBackend, TcpBackendConfig, MAX_HEADER_SIZE};

/// Re-exports of the types most applications need.
///
/// ```rust
/// use mill_tcp::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{NetworkError, Result};
    pub use crate::net::tcp::traits::{
        ConnectionId, DataSentHandler, DisconnectHandler, DisconnectReason, FrameHandler,
        HeaderAction, LogLevel, Logger, RecvTimeoutHandler,
    };
    pub use crate::net::tcp::{BackendContext, TcpBackend, TcpBackendConfig};
}
