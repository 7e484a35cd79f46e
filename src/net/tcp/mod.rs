//! Framed TCP backend with thread-driven connection management.
//!
//! A [`TcpBackend`] owns every connection it accepted or established. Each
//! connection exchanges length-framed messages: a fixed-size header (at most
//! [`MAX_HEADER_SIZE`] bytes) whose [`FrameHandler`] decides how large the body
//! that follows is.
//!
//! ```text
//! Backend state:
//!   Mutex<Vec<Arc<ListenEntry>>>                  one accept thread per address
//!   Mutex<HashMap<ConnectionId, Arc<Connection>>>
//!        │
//!        ├──> conn#1 ──> Connection { socket, callbacks, send lock, recv thread }
//!        └──> conn#N ──> Connection { ... }
//! ```
//!
//! ## Receive pipeline
//!
//! ```text
//! thread-per-connection (reactor_workers == 0):
//!    recv thread ──> wait for set_recv_callbacks ──> header ──> on_header()
//!                       ──> body ──> on_body() ──> header ──> ...
//!
//! reactor (reactor_workers > 0):
//!    poll thread ──> worker ──> drain socket ──> on_header()/on_body()
//!
//! end of stream / error / callback says stop:
//!    invalidate socket ──> on_disconnect() exactly once ──> shutdown ──> close
//! ```
//!
//! ## Sending
//!
//! [`BackendContext::send`] is synchronous and serialized per connection. It
//! may block for minutes under pathological network conditions, so do not call
//! it from a context that cannot tolerate that.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mill_tcp::net::tcp::{TcpBackend, TcpBackendConfig};
//! use mill_tcp::net::tcp::traits::{ConnectionId, FrameHandler, HeaderAction};
//!
//! struct Printer;
//!
//! impl FrameHandler for Printer {
//!     fn on_header(&self, _id: ConnectionId, header: &[u8]) -> HeaderAction {
//!         let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
//!         HeaderAction::Body(vec![0; len as usize])
//!     }
//!
//!     fn on_body(&self, id: ConnectionId, _header: &[u8], body: Vec<u8>, _failed: bool) -> bool {
//!         println!("{id}: {} bytes", body.len());
//!         true
//!     }
//! }
//!
//! # fn main() -> mill_tcp::error::Result<()> {
//! let server = TcpBackend::new(TcpBackendConfig::default())?;
//! server.start_listen(1345, "127.0.0.1", |ctx, id, _peer| {
//!     ctx.set_recv_callbacks(id, 4, Arc::new(Printer), "server").is_ok()
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connect;
pub(crate) mod connection;
pub mod listen;
pub(crate) mod reactor_recv;
pub mod recv;
pub mod send;
pub(crate) mod status;
pub mod traits;


use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::Builder;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::Socket;
use uuid::Uuid;

use crate::error::{NetworkError, Result};
use crate::net::socket;
use crate::reactor::Reactor;

pub use config::{TcpBackendConfig, TcpBackendConfigBuilder};
pub use connection::{DEFAULT_RECV_TIMEOUT, MAX_HEADER_SIZE};
use connection::Connection;
use listen::ListenEntry;
use status::{StatusReporter, TransferCounters};
use traits::{
    ConnectionId, DataSentHandler, DisconnectHandler, DisconnectReason, FrameHandler, LogLevel,
    Logger, PrefixedLogger, RecvTimeoutHandler,
};

/// Shared state behind every [`BackendContext`].
pub(crate) struct BackendInner {
    pub(crate) config: TcpBackendConfig,
    pub(crate) logger: Arc<dyn Logger>,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    pub(crate) listen_entries: Mutex<Vec<Arc<ListenEntry>>>,
    next_conn_id: AtomicU64,
    pub(crate) counters: Arc<TransferCounters>,
    reactor: Mutex<Option<Arc<Reactor>>>,
    status: Mutex<Option<StatusReporter>>,
    torn_down: AtomicBool,
}

/// Cloneable handle to a backend. Passed to connected callbacks so they can
/// install receive callbacks or send right away.
#[derive(Clone)]
pub struct BackendContext {
    pub(crate) inner: Arc<BackendInner>,
}

/// Owner of the backend. Dropping it stops listening, tears down every
/// connection and joins all threads.
pub struct TcpBackend {
    ctx: BackendContext,
}

impl TcpBackend {
    pub fn new(config: TcpBackendConfig) -> Result<Self> {
        let logger = PrefixedLogger::wrap(config.logger.clone(), config.log_prefix.as_deref());
        let status_interval = config.status_update_seconds;

        let inner = Arc::new(BackendInner {
            config,
            logger,
            connections: Mutex::new(HashMap::new()),
            listen_entries: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
            counters: Arc::new(TransferCounters::default()),
            reactor: Mutex::new(None),
            status: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });

        if status_interval > 0 {
            let reporter = StatusReporter::start(
                Arc::downgrade(&inner),
                Duration::from_secs(u64::from(status_interval)),
            )
            .map_err(|source| NetworkError::Thread {
                name: "mill-tcp-stat".to_string(),
                source,
            })?;
            *inner.status.lock() = Some(reporter);
        }

        Ok(Self {
            ctx: BackendContext { inner },
        })
    }

    pub fn context(&self) -> BackendContext {
        self.ctx.clone()
    }
}

impl Deref for TcpBackend {
    type Target = BackendContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl Drop for TcpBackend {
    fn drop(&mut self) {
        self.ctx.inner.teardown();
    }
}

impl BackendContext {
    /// Installs the framed receive callbacks and releases the receive side.
    ///
    /// `header_size` must be between 1 and [`MAX_HEADER_SIZE`].
    pub fn set_recv_callbacks(
        &self,
        conn_id: ConnectionId,
        header_size: usize,
        handler: Arc<dyn FrameHandler>,
        hint: &str,
    ) -> Result<()> {
        if header_size > MAX_HEADER_SIZE {
            return Err(NetworkError::HeaderTooLarge {
                size: header_size,
                max: MAX_HEADER_SIZE,
            });
        }
        if header_size == 0 {
            return Err(NetworkError::Config("header size must not be zero".to_string()));
        }

        let conn = self.inner.connection(conn_id)?;
        conn.set_recv_callbacks(header_size, handler, hint);

        if let Some(reactor) = self.inner.ensure_initialized()? {
            reactor_recv::attach(&reactor, &conn, self.inner.counters.clone()).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotConnected {
                    NetworkError::Disconnected(conn_id)
                } else {
                    NetworkError::Io(e)
                }
            })?;
        }
        conn.ready.set();
        Ok(())
    }

    /// The handler fires exactly once. If the connection is already gone it
    /// fires before this returns.
    pub fn set_disconnect_callback(
        &self,
        conn_id: ConnectionId,
        handler: Arc<dyn DisconnectHandler>,
    ) -> Result<()> {
        self.inner.connection(conn_id)?.set_disconnect(handler);
        Ok(())
    }

    /// A zero timeout restores [`DEFAULT_RECV_TIMEOUT`].
    pub fn set_recv_timeout(
        &self,
        conn_id: ConnectionId,
        timeout: Duration,
        handler: Option<Arc<dyn RecvTimeoutHandler>>,
    ) -> Result<()> {
        self.inner
            .connection(conn_id)?
            .set_recv_timeout(timeout, handler);
        Ok(())
    }

    /// Lets body reads complete with fewer bytes than requested.
    pub fn set_allow_less_than_body_size(&self, conn_id: ConnectionId, allow: bool) -> Result<()> {
        self.inner.connection(conn_id)?.set_allow_less(allow);
        Ok(())
    }

    pub fn set_data_sent_callback(
        &self,
        conn_id: ConnectionId,
        handler: Option<Arc<dyn DataSentHandler>>,
    ) -> Result<()> {
        self.inner.connection(conn_id)?.set_data_sent(handler);
        Ok(())
    }

    /// Shuts the socket down in both directions. The receive side notices and
    /// tears the connection down. Unknown or dead connections are a no-op.
    pub fn shutdown(&self, conn_id: ConnectionId) -> bool {
        match self.inner.find(conn_id) {
            Some(conn) => conn.shutdown("Shutdown"),
            None => {
                self.inner.logger.log(
                    LogLevel::Debug,
                    &format!("Shutdown on unknown connection {conn_id}"),
                );
                true
            }
        }
    }

    /// Removes the connection, closing it first if it is still alive.
    pub fn delete_connection(&self, conn_id: ConnectionId) {
        let conn = self.inner.connections.lock().remove(&conn_id);
        if let Some(conn) = conn {
            self.inner
                .destroy(&conn, DisconnectReason::Shutdown, "DeleteConnection");
        }
    }

    /// `(sent, received)` byte totals over all connections.
    pub fn total_send_and_recv(&self) -> (u64, u64) {
        self.inner.counters.totals()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn connection_uid(&self, conn_id: ConnectionId) -> Option<Uuid> {
        self.inner.find(conn_id).map(|c| c.uid())
    }

    pub fn peer_addr(&self, conn_id: ConnectionId) -> Option<SocketAddr> {
        self.inner.find(conn_id).map(|c| c.peer_addr())
    }

    /// `None` while the connection is alive or unknown.
    pub fn disconnect_reason(&self, conn_id: ConnectionId) -> Option<DisconnectReason> {
        self.inner.find(conn_id).and_then(|c| c.disconnect_reason())
    }

    /// Logs backend statistics and the TCP state of the given connections.
    pub fn validate(&self, conn_ids: &[ConnectionId]) {
        let logger = &*self.inner.logger;
        logger.log(LogLevel::Info, "  TcpBackend");
        self.inner.log_statistics(None);
        for &conn_id in conn_ids {
            match self.inner.find(conn_id).and_then(|c| c.socket()) {
                Some(socket) => {
                    socket::log_tcp_info(logger, &socket, &conn_id.to_string());
                }
                None => logger.log(LogLevel::Info, &format!("    {conn_id} not connected")),
            }
        }
    }
}

impl BackendInner {
    pub(crate) fn find(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&conn_id).cloned()
    }

    pub(crate) fn connection(&self, conn_id: ConnectionId) -> Result<Arc<Connection>> {
        self.find(conn_id)
            .ok_or(NetworkError::UnknownConnection(conn_id))
    }

    /// Starts the reactor on first use when reactor mode is configured.
    pub(crate) fn ensure_initialized(&self) -> Result<Option<Arc<Reactor>>> {
        if self.config.reactor_workers == 0 {
            return Ok(None);
        }
        let mut slot = self.reactor.lock();
        if let Some(reactor) = slot.as_ref() {
            return Ok(Some(reactor.clone()));
        }
        let reactor = Reactor::start(usize::from(self.config.reactor_workers), self.logger.clone())
            .map_err(|source| NetworkError::Thread {
                name: "mill-tcp-reactor".to_string(),
                source,
            })?;
        self.logger.log(
            LogLevel::Debug,
            &format!(
                "Started receive reactor with {} workers",
                self.config.reactor_workers
            ),
        );
        let reactor = Arc::new(reactor);
        *slot = Some(reactor.clone());
        Ok(Some(reactor))
    }

    /// Options shared by accepted and outgoing sockets.
    pub(crate) fn prepare_socket(&self, socket: &Socket, hint: &str) {
        let logger = &*self.logger;
        if self.config.disable_nagle {
            socket::disable_nagle(logger, socket, hint);
        }
        socket::set_keep_alive(logger, socket, hint);
        socket::set_linger(logger, socket, socket::LINGER_SECONDS, hint);
    }

    /// Inserts a freshly connected socket and starts its receive thread when
    /// not in reactor mode.
    pub(crate) fn add_connection(&self, socket: Socket, peer: SocketAddr) -> Result<Arc<Connection>> {
        let id = ConnectionId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(id, socket, peer, self.logger.clone()));

        let mut connections = self.connections.lock();
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(NetworkError::Disconnected(id));
        }
        if self.config.reactor_workers == 0 {
            let thread_conn = conn.clone();
            let counters = self.counters.clone();
            let handle = Builder::new()
                .name("mill-tcp-recv".to_string())
                .spawn(move || recv::run_recv_thread(thread_conn, counters))
                .map_err(|source| NetworkError::Thread {
                    name: "mill-tcp-recv".to_string(),
                    source,
                })?;
            conn.set_recv_thread(handle);
        }
        connections.insert(id, conn.clone());
        Ok(conn)
    }

    /// Removes a connection its connected callback turned down.
    pub(crate) fn discard(&self, conn: &Arc<Connection>, hint: &str) {
        self.connections.lock().remove(&conn.id());
        self.destroy(conn, DisconnectReason::Declined, hint);
    }

    /// Invalidates, shuts down and closes a connection that is no longer in
    /// the connection set, joining its receive side first. The disconnect
    /// handler has fired when this returns.
    pub(crate) fn destroy(&self, conn: &Arc<Connection>, reason: DisconnectReason, hint: &str) {
        let logger = &*self.logger;
        let closed = conn.invalidate(reason);
        if let Some(closed) = &closed {
            closed.shutdown(logger, hint);
        }
        conn.ready.set();
        conn.join_recv_thread();
        if let Some(attachment) = conn.take_attachment() {
            attachment.detach(logger);
        }
        conn.fire_disconnect(reason);
        if let Some(closed) = closed {
            closed.close(logger, hint);
        }
    }

    pub(crate) fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_listen();

        let connections: Vec<_> = {
            let mut connections = self.connections.lock();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &connections {
            self.destroy(conn, DisconnectReason::Shutdown, "TcpBackend drop");
        }

        let reactor = self.reactor.lock().take();
        if let Some(reactor) = reactor {
            reactor.shutdown();
        }
        let status = self.status.lock().take();
        if let Some(status) = status {
            status.stop();
        }
    }

    /// Logs connection count and byte totals. With `previous` totals the
    /// deltas are logged too. Returns the current totals.
    pub(crate) fn log_statistics(&self, previous: Option<(u64, u64)>) -> (u64, u64) {
        let (sent, recv) = self.counters.totals();
        let count = self.connections.lock().len();
        let message = match previous {
            Some((last_sent, last_recv)) => format!(
                "TcpBackend connections={count} sent={sent} (+{}) recv={recv} (+{})",
                sent.saturating_sub(last_sent),
                recv.saturating_sub(last_recv)
            ),
            None => format!("TcpBackend connections={count} sent={sent} recv={recv}"),
        };
        self.logger.log(LogLevel::Info, &message);
        (sent, recv)
    }

    pub(crate) fn dump_diagnostics(&self, socket: &Socket, hint: &str) {
        self.log_statistics(None);
        socket::log_tcp_info(&*self.logger, socket, hint);
    }
}
