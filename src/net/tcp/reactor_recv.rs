//! Framed receive path for reactor mode.
//!
//! Each attached connection registers a duplicate of its socket with the
//! shared [`Reactor`]. Workers drain the socket until `WouldBlock`, advancing
//! a small header/body state machine under the connection's receive lock.
//! When the stream ends, a short-lived helper thread fires the disconnect
//! handler and closes the socket, so workers never run that callback.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread::{self, Builder, ThreadId};

use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::Socket;

use crate::event::ReadinessEvent;
use crate::handler::EventHandler;
use crate::net::tcp::connection::{Connection, MAX_HEADER_SIZE};
use crate::net::tcp::status::TransferCounters;
use crate::net::tcp::traits::{DisconnectReason, HeaderAction, LogLevel, Logger};
use crate::poll::PollHandle;
use crate::reactor::Reactor;

/// Registration of one connection with the reactor.
pub(crate) struct ReactorAttachment {
    token: Token,
    stream: mio::net::TcpStream,
    handle: Arc<PollHandle>,
    recv: Arc<ReactorRecv>,
}

impl ReactorAttachment {
    /// Deregisters the socket and waits for a worker still inside one of the
    /// connection's frame callbacks. No frame callback runs after this
    /// returns, except the one the caller itself may be inside.
    pub(crate) fn detach(mut self, logger: &dyn Logger) {
        if let Err(e) = self.handle.deregister(&mut self.stream, self.token) {
            logger.log(
                LogLevel::Debug,
                &format!("Failed to deregister {:?} from reactor ({e})", self.token),
            );
        }
        self.recv.stop();
    }
}

pub(crate) fn token_for(conn: &Connection) -> Token {
    Token(conn.id().as_u64() as usize)
}

/// Registers the connection with the reactor unless it already is.
pub(crate) fn attach(
    reactor: &Reactor,
    conn: &Arc<Connection>,
    counters: Arc<TransferCounters>,
) -> io::Result<()> {
    let handler = Arc::new(ReactorRecv {
        conn: conn.clone(),
        counters,
        state: Mutex::new(RecvState::default()),
        pumping: Mutex::new(None),
    });
    let handle = reactor.handle().clone();
    let token = token_for(conn);

    conn.attach_with(|socket: &Arc<Socket>| {
        socket.set_nonblocking(true)?;
        let dup = socket.try_clone()?;
        let mut stream = mio::net::TcpStream::from_std(std::net::TcpStream::from(dup));
        handle.register(&mut stream, token, Interest::READABLE, handler.clone())?;
        Ok(ReactorAttachment {
            token,
            stream,
            handle,
            recv: handler,
        })
    })
}

struct RecvState {
    header: [u8; MAX_HEADER_SIZE],
    /// Bytes of the current header or body received so far.
    filled: usize,
    /// Set while a body is being received.
    body: Option<Vec<u8>>,
    finished: bool,
}

impl Default for RecvState {
    fn default() -> Self {
        Self {
            header: [0u8; MAX_HEADER_SIZE],
            filled: 0,
            body: None,
            finished: false,
        }
    }
}

struct ReactorRecv {
    conn: Arc<Connection>,
    counters: Arc<TransferCounters>,
    state: Mutex<RecvState>,
    /// Worker currently running `pump`, if any.
    pumping: Mutex<Option<ThreadId>>,
}

impl EventHandler for ReactorRecv {
    fn handle_event(&self, event: &ReadinessEvent) {
        if !event.wants_read() {
            return;
        }

        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        *self.pumping.lock() = Some(thread::current().id());
        let outcome = self.pump(&mut state);
        *self.pumping.lock() = None;
        let Some(reason) = outcome else {
            return;
        };
        state.finished = true;
        drop(state);

        self.finish(reason);
    }
}

impl ReactorRecv {
    fn stop(&self) {
        // Called from inside a frame callback: the pump loop sees the
        // invalidated socket and ends on its own.
        if *self.pumping.lock() == Some(thread::current().id()) {
            return;
        }
        self.state.lock().finished = true;
    }

    /// Reads until `WouldBlock` (`None`) or the end of the connection.
    fn pump(&self, state: &mut RecvState) -> Option<DisconnectReason> {
        let conn = &*self.conn;
        loop {
            let Some(socket) = conn.socket() else {
                return Some(DisconnectReason::Shutdown);
            };
            let settings = conn.recv_settings();
            let Some(frame) = settings.frame else {
                return Some(DisconnectReason::Shutdown);
            };
            let header_size = settings.header_size.min(MAX_HEADER_SIZE);

            let read = {
                let buf: &mut [u8] = match state.body.as_mut() {
                    Some(body) => &mut body[state.filled..],
                    None => &mut state.header[state.filled..header_size],
                };
                let mut socket: &Socket = &socket;
                socket.read(buf)
            };

            let n = match read {
                Ok(0) => return Some(DisconnectReason::Graceful),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let level = match e.kind() {
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                            LogLevel::Info
                        }
                        _ => LogLevel::Warn,
                    };
                    conn.logger.log(
                        level,
                        &format!(
                            "{} ({}) recv error: {e} ({})",
                            conn.id(),
                            conn.uid(),
                            settings.hint
                        ),
                    );
                    return Some(DisconnectReason::Error);
                }
            };
            state.filled += n;
            self.counters.add_recv(n);

            match state.body.take() {
                None => {
                    if state.filled < header_size {
                        continue;
                    }
                    state.filled = 0;
                    match frame.on_header(conn.id(), &state.header[..header_size]) {
                        HeaderAction::Continue => {}
                        HeaderAction::Disconnect => return Some(DisconnectReason::Declined),
                        HeaderAction::Body(body) if body.is_empty() => {}
                        HeaderAction::Body(body) => state.body = Some(body),
                    }
                }
                Some(mut body) => {
                    if state.filled < body.len() && !settings.allow_less {
                        state.body = Some(body);
                        continue;
                    }
                    body.truncate(state.filled);
                    state.filled = 0;
                    if !frame.on_body(conn.id(), &state.header[..header_size], body, false) {
                        return Some(DisconnectReason::Declined);
                    }
                }
            }
        }
    }

    fn finish(&self, reason: DisconnectReason) {
        let conn = self.conn.clone();
        let logger = conn.logger.clone();
        // Whoever invalidated first owns the teardown.
        let Some(closed) = conn.invalidate(reason) else {
            return;
        };
        if let Some(attachment) = conn.take_attachment() {
            attachment.detach(&*logger);
        }

        let helper_conn = conn.clone();
        let spawned = Builder::new()
            .name("mill-tcp-sdwn".to_string())
            .spawn(move || {
                helper_conn.fire_disconnect(reason);
                closed.shutdown(&*helper_conn.logger, "reactor disconnect");
                closed.close(&*helper_conn.logger, "reactor disconnect");
            });
        match spawned {
            Ok(handle) => conn.set_recv_thread(handle),
            Err(e) => {
                logger.log(
                    LogLevel::Error,
                    &format!("Failed to spawn disconnect helper for {} ({e})", conn.id()),
                );
                conn.fire_disconnect(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::traits::{ConnectionId, FrameHandler, NoOpLogger};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::time::Duration;
    use uuid::Uuid;

    struct Collect {
        tx: Mutex<mpsc::Sender<(Vec<u8>, Vec<u8>)>>,
    }

    impl FrameHandler for Collect {
        fn on_header(&self, _id: ConnectionId, header: &[u8]) -> HeaderAction {
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if len == 0 {
                let _ = self.tx.lock().send((header.to_vec(), Vec::new()));
                return HeaderAction::Continue;
            }
            HeaderAction::Body(vec![0u8; len as usize])
        }

        fn on_body(&self, _id: ConnectionId, header: &[u8], body: Vec<u8>, _failed: bool) -> bool {
            let _ = self.tx.lock().send((header.to_vec(), body));
            true
        }
    }

    #[test]
    fn test_reactor_receives_frames_and_disconnects() {
        let reactor = Reactor::start(2, Arc::new(NoOpLogger)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();

        let conn = Arc::new(Connection::new(
            ConnectionId(9),
            Socket::from(server),
            peer,
            Arc::new(NoOpLogger),
        ));
        let (tx, rx) = mpsc::channel();
        conn.set_recv_callbacks(4, Arc::new(Collect { tx: Mutex::new(tx) }), "test");

        let (dtx, drx) = mpsc::channel();
        let dtx = Mutex::new(dtx);
        conn.set_disconnect(Arc::new(
            move |_id: ConnectionId, _uid: Uuid, reason: DisconnectReason| {
                let _ = dtx.lock().send(reason);
            },
        ));

        let counters = Arc::new(TransferCounters::default());
        attach(&reactor, &conn, counters.clone()).unwrap();
        // attaching twice is a no-op
        attach(&reactor, &conn, counters.clone()).unwrap();

        client.write_all(&5u32.to_le_bytes()).unwrap();
        client.write_all(b"hello").unwrap();
        client.write_all(&0u32.to_le_bytes()).unwrap();

        let (header, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(header, 5u32.to_le_bytes());
        assert_eq!(body, b"hello");
        let (header, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(header, 0u32.to_le_bytes());
        assert!(body.is_empty());

        drop(client);
        assert_eq!(
            drx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DisconnectReason::Graceful
        );
        conn.join_recv_thread();
        assert!(!conn.is_valid());
        assert_eq!(counters.totals().1, 13);
        assert!(reactor.handle().is_empty());
    }
}
