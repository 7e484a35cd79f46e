//! Per-socket connection state.
//!
//! A [`Connection`] lives in the backend's connection set behind an `Arc`. Its
//! socket handle sits in the state lock as `Option<Arc<Socket>>`; `None` is the
//! invalid sentinel. Once the socket has been invalidated it never becomes
//! valid again.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::Socket;
use uuid::Uuid;

use crate::net::socket;
use crate::net::tcp::reactor_recv::ReactorAttachment;
use crate::net::tcp::send::SendWriter;
use crate::net::tcp::traits::{
    ConnectionId, DataSentHandler, DisconnectHandler, DisconnectReason, FrameHandler, LogLevel,
    Logger, RecvTimeoutHandler,
};
use crate::signal::Signal;

/// Upper bound for the fixed header size of a framed message.
pub const MAX_HEADER_SIZE: usize = 33;

/// Receive timeout used when none has been configured.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub(crate) struct Connection {
    id: ConnectionId,
    uid: Uuid,
    peer_addr: SocketAddr,
    pub(crate) logger: Arc<dyn Logger>,
    state: Mutex<ConnectionState>,
    /// Serializes sends. Never held while a callback runs.
    pub(crate) send_lock: Mutex<()>,
    /// Serializes the grace checks of timed out completion sends.
    pub(crate) timeout_lock: Mutex<()>,
    /// Released once receive callbacks are installed, or on teardown.
    pub(crate) ready: Signal,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

struct ConnectionState {
    socket: Option<Arc<Socket>>,
    header_size: usize,
    allow_less: bool,
    recv_timeout: Duration,
    recv_hint: String,
    frame: Option<Arc<dyn FrameHandler>>,
    timeout_handler: Option<Arc<dyn RecvTimeoutHandler>>,
    data_sent: Option<Arc<dyn DataSentHandler>>,
    disconnect: Option<Arc<dyn DisconnectHandler>>,
    /// Reason recorded by whoever initiated the close.
    requested_reason: Option<DisconnectReason>,
    /// Set once the disconnect handler has been (or would have been) fired.
    disconnected: Option<DisconnectReason>,
    writer: Option<SendWriter>,
    reactor: Option<ReactorAttachment>,
}

/// Snapshot of the receive settings taken by the receive loops.
pub(crate) struct RecvSettings {
    pub header_size: usize,
    pub allow_less: bool,
    pub hint: String,
    pub frame: Option<Arc<dyn FrameHandler>>,
}

/// What invalidation took out of the connection; closing it is up to the
/// caller.
pub(crate) struct Invalidated {
    socket: Arc<Socket>,
    writer: Option<SendWriter>,
}

impl Invalidated {
    pub(crate) fn shutdown(&self, logger: &dyn Logger, hint: &str) -> bool {
        socket::shutdown_socket(logger, Some(&self.socket), hint)
    }

    /// Stops the writer thread and closes the socket. Other clones of the
    /// handle (a receive loop still unwinding) close it when they drop.
    pub(crate) fn close(self, logger: &dyn Logger, hint: &str) -> bool {
        if let Some(writer) = self.writer {
            writer.finish();
        }
        match Arc::try_unwrap(self.socket) {
            Ok(socket) => socket::close_socket(logger, Some(socket), hint),
            Err(_) => true,
        }
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        socket: Socket,
        peer_addr: SocketAddr,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            id,
            uid: Uuid::new_v4(),
            peer_addr,
            logger,
            state: Mutex::new(ConnectionState {
                socket: Some(Arc::new(socket)),
                header_size: 0,
                allow_less: false,
                recv_timeout: Duration::ZERO,
                recv_hint: String::new(),
                frame: None,
                timeout_handler: None,
                data_sent: None,
                disconnect: None,
                requested_reason: None,
                disconnected: None,
                writer: None,
                reactor: None,
            }),
            send_lock: Mutex::new(()),
            timeout_lock: Mutex::new(()),
            ready: Signal::new(),
            recv_thread: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn uid(&self) -> Uuid {
        self.uid
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn socket(&self) -> Option<Arc<Socket>> {
        self.state.lock().socket.clone()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state.lock().socket.is_some()
    }

    pub(crate) fn set_recv_callbacks(
        &self,
        header_size: usize,
        frame: Arc<dyn FrameHandler>,
        hint: &str,
    ) {
        let mut state = self.state.lock();
        state.header_size = header_size;
        state.frame = Some(frame);
        state.recv_hint = hint.to_string();
    }

    pub(crate) fn recv_settings(&self) -> RecvSettings {
        let state = self.state.lock();
        RecvSettings {
            header_size: state.header_size,
            allow_less: state.allow_less,
            hint: state.recv_hint.clone(),
            frame: state.frame.clone(),
        }
    }

    pub(crate) fn set_allow_less(&self, allow: bool) {
        self.state.lock().allow_less = allow;
    }

    pub(crate) fn set_recv_timeout(
        &self,
        timeout: Duration,
        handler: Option<Arc<dyn RecvTimeoutHandler>>,
    ) {
        let mut state = self.state.lock();
        state.recv_timeout = timeout;
        state.timeout_handler = handler;
    }

    /// The configured receive timeout, or [`DEFAULT_RECV_TIMEOUT`].
    pub(crate) fn recv_timeout(&self) -> (Duration, Option<Arc<dyn RecvTimeoutHandler>>) {
        let state = self.state.lock();
        let timeout = if state.recv_timeout.is_zero() {
            DEFAULT_RECV_TIMEOUT
        } else {
            state.recv_timeout
        };
        (timeout, state.timeout_handler.clone())
    }

    pub(crate) fn set_data_sent(&self, handler: Option<Arc<dyn DataSentHandler>>) {
        self.state.lock().data_sent = handler;
    }

    pub(crate) fn data_sent(&self) -> Option<Arc<dyn DataSentHandler>> {
        self.state.lock().data_sent.clone()
    }

    /// Installs the disconnect handler. If the connection already went away
    /// the handler runs right away with the recorded reason.
    pub(crate) fn set_disconnect(&self, handler: Arc<dyn DisconnectHandler>) {
        let fired = {
            let mut state = self.state.lock();
            match state.disconnected {
                Some(reason) => Some(reason),
                None => {
                    state.disconnect = Some(handler.clone());
                    None
                }
            }
        };
        if let Some(reason) = fired {
            handler.on_disconnect(self.id, self.uid, reason);
        }
    }

    /// Fires the disconnect handler at most once for the lifetime of the
    /// connection. A reason recorded by the initiator of the close wins over
    /// `reason`.
    pub(crate) fn fire_disconnect(&self, reason: DisconnectReason) {
        let handler = {
            let mut state = self.state.lock();
            if state.disconnected.is_some() {
                return;
            }
            let reason = state.requested_reason.unwrap_or(reason);
            state.disconnected = Some(reason);
            state.frame = None;
            state.timeout_handler = None;
            state.disconnect.take().map(|h| (h, reason))
        };
        if let Some((handler, reason)) = handler {
            handler.on_disconnect(self.id, self.uid, reason);
        }
    }

    pub(crate) fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.state.lock().disconnected
    }

    /// Half of a graceful close: shuts the socket down and leaves the rest to
    /// the receive side, which sees end of stream.
    pub(crate) fn shutdown(&self, hint: &str) -> bool {
        let mut state = self.state.lock();
        let Some(socket) = state.socket.clone() else {
            return true;
        };
        state.requested_reason.get_or_insert(DisconnectReason::Shutdown);
        socket::shutdown_socket(&*self.logger, Some(&socket), hint)
    }

    /// Swaps the socket for the invalid sentinel. Only the first call gets
    /// the socket back; later calls return `None`.
    pub(crate) fn invalidate(&self, reason: DisconnectReason) -> Option<Invalidated> {
        let mut state = self.state.lock();
        state.requested_reason.get_or_insert(reason);
        let socket = state.socket.take()?;
        Some(Invalidated {
            socket,
            writer: state.writer.take(),
        })
    }

    pub(crate) fn with_writer<R>(
        &self,
        f: impl FnOnce(&Arc<Socket>, &mut Option<SendWriter>) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let socket = state.socket.as_ref()?;
        Some(f(socket, &mut state.writer))
    }

    /// Runs `register` under the state lock unless the connection is already
    /// attached. Fails with `NotConnected` once the socket is invalid.
    pub(crate) fn attach_with(
        &self,
        register: impl FnOnce(&Arc<Socket>) -> io::Result<ReactorAttachment>,
    ) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.reactor.is_some() {
            return Ok(());
        }
        let Some(socket) = state.socket.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let attachment = register(socket)?;
        state.reactor = Some(attachment);
        Ok(())
    }

    pub(crate) fn take_attachment(&self) -> Option<ReactorAttachment> {
        self.state.lock().reactor.take()
    }

    pub(crate) fn set_recv_thread(&self, handle: JoinHandle<()>) {
        *self.recv_thread.lock() = Some(handle);
    }

    /// Joins the receive thread (or reactor teardown helper) unless called
    /// from that very thread.
    pub(crate) fn join_recv_thread(&self) {
        let handle = self.recv_thread.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            self.logger.log(
                LogLevel::Error,
                &format!("Receive thread of {} panicked", self.id),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::traits::NoOpLogger;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connection() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let conn = Connection::new(
            ConnectionId(1),
            Socket::from(server),
            peer,
            Arc::new(NoOpLogger),
        );
        (conn, client)
    }

    fn counting_handler(
        count: &Arc<AtomicUsize>,
        reasons: &Arc<Mutex<Vec<DisconnectReason>>>,
    ) -> Arc<dyn DisconnectHandler> {
        let count = count.clone();
        let reasons = reasons.clone();
        Arc::new(move |_id: ConnectionId, _uid: Uuid, reason: DisconnectReason| {
            count.fetch_add(1, Ordering::SeqCst);
            reasons.lock().push(reason);
        })
    }

    #[test]
    fn test_disconnect_fires_once() {
        let (conn, _client) = connection();
        let count = Arc::new(AtomicUsize::new(0));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        conn.set_disconnect(counting_handler(&count, &reasons));

        conn.fire_disconnect(DisconnectReason::Graceful);
        conn.fire_disconnect(DisconnectReason::Error);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(reasons.lock().as_slice(), &[DisconnectReason::Graceful]);
    }

    #[test]
    fn test_late_disconnect_handler_fires_immediately() {
        let (conn, _client) = connection();
        conn.fire_disconnect(DisconnectReason::TimedOut);

        let count = Arc::new(AtomicUsize::new(0));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        conn.set_disconnect(counting_handler(&count, &reasons));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(reasons.lock().as_slice(), &[DisconnectReason::TimedOut]);
    }

    #[test]
    fn test_invalidate_only_once() {
        let (conn, _client) = connection();
        assert!(conn.is_valid());
        let first = conn.invalidate(DisconnectReason::Shutdown);
        assert!(first.is_some());
        assert!(!conn.is_valid());
        assert!(conn.invalidate(DisconnectReason::Error).is_none());
        assert!(conn.socket().is_none());

        let logger = NoOpLogger;
        let first = first.unwrap();
        assert!(first.shutdown(&logger, "test"));
        assert!(first.close(&logger, "test"));
        // shutting down an invalid connection is a no-op
        assert!(conn.shutdown("test"));
    }

    #[test]
    fn test_requested_reason_wins() {
        let (conn, _client) = connection();
        let count = Arc::new(AtomicUsize::new(0));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        conn.set_disconnect(counting_handler(&count, &reasons));

        assert!(conn.shutdown("test"));
        conn.fire_disconnect(DisconnectReason::Graceful);
        assert_eq!(reasons.lock().as_slice(), &[DisconnectReason::Shutdown]);
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::Shutdown));
    }

    #[test]
    fn test_default_recv_timeout() {
        let (conn, _client) = connection();
        assert_eq!(conn.recv_timeout().0, DEFAULT_RECV_TIMEOUT);
        conn.set_recv_timeout(Duration::from_millis(250), None);
        assert_eq!(conn.recv_timeout().0, Duration::from_millis(250));
    }

    #[test]
    fn test_join_recv_thread() {
        let (conn, _client) = connection();
        conn.join_recv_thread();
        conn.set_recv_thread(thread::spawn(|| {}));
        conn.join_recv_thread();
        conn.join_recv_thread();
    }
}
