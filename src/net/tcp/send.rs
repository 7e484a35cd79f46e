//! Send path.
//!
//! Two strategies share the same contract: `send` returns once every byte has
//! been accepted by the OS, or once a failure is certain.
//!
//! - Blocking: write on the caller's thread under the connection's send lock,
//!   waiting for writability on `WouldBlock`.
//! - Completion: hand the bytes to the connection's writer thread and wait on
//!   a per-call completion channel. The send lock only covers submission.
//!
//! Both escalate a stalled send the same way: a diagnostic dump after 40
//! seconds, failure after a further 10 minutes.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use mio::Interest;
use socket2::Socket;

use crate::error::{NetworkError, Result, SendError};
use crate::net::tcp::connection::Connection;
use crate::net::tcp::traits::{ConnectionId, LogLevel};
use crate::net::tcp::BackendContext;
use crate::poll::SocketPoll;

/// First wait for writability before diagnostics are dumped.
pub const SEND_WAIT: Duration = Duration::from_secs(40);

/// Second, final wait.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(600);

const COMPLETION_WAIT: Duration = Duration::from_secs(38);
const COMPLETION_GRACE: Duration = Duration::from_secs(2);
const COMPLETION_RETRY: Duration = Duration::from_secs(4);

impl BackendContext {
    /// Sends `data` on the connection, blocking until the OS accepted all of
    /// it.
    ///
    /// The sent-byte total and the data-sent handler are updated whether or
    /// not the send succeeded. Sending on a connection that already went away
    /// returns [`NetworkError::Disconnected`] or
    /// [`NetworkError::UnknownConnection`].
    pub fn send(&self, conn_id: ConnectionId, data: &[u8], hint: &str) -> Result<()> {
        let conn = self.inner.connection(conn_id)?;
        let dump = |socket: &Socket| self.inner.dump_diagnostics(socket, hint);

        let result = if self.inner.config.use_overlapped_send {
            send_completion(&conn, data, hint, &dump)
        } else {
            send_blocking(&conn, data, hint, &dump)
        };

        self.inner.counters.add_sent(data.len());
        if let Some(handler) = conn.data_sent() {
            handler.on_data_sent(conn_id, data.len());
        }

        result.map_err(|source| match source {
            SendError::Disconnected => NetworkError::Disconnected(conn_id),
            source => NetworkError::Send {
                id: conn_id,
                source,
            },
        })
    }
}

pub(crate) fn send_blocking(
    conn: &Connection,
    data: &[u8],
    hint: &str,
    dump: &dyn Fn(&Socket),
) -> std::result::Result<(), SendError> {
    let _guard = conn.send_lock.lock();
    let Some(socket) = conn.socket() else {
        return Err(SendError::Disconnected);
    };

    let mut written = 0;
    let mut poll: Option<SocketPoll> = None;
    while written < data.len() {
        match socket.send(&data[written..]) {
            Ok(0) => return Err(SendError::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if poll.is_none() {
                    poll = Some(SocketPoll::stream(&socket, Interest::WRITABLE)?);
                }
                if let Some(poll) = poll.as_mut() {
                    wait_writable(conn, poll, &socket, hint, dump)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                conn.logger.log(
                    LogLevel::Info,
                    &format!(
                        "Send of {} bytes on {} ({}) failed after {written} bytes: {e} ({hint})",
                        data.len(),
                        conn.id(),
                        conn.uid()
                    ),
                );
                return Err(SendError::Io(e));
            }
        }
    }
    Ok(())
}

fn wait_writable(
    conn: &Connection,
    poll: &mut SocketPoll,
    socket: &Socket,
    hint: &str,
    dump: &dyn Fn(&Socket),
) -> std::result::Result<(), SendError> {
    if poll.wait(Some(SEND_WAIT))? {
        return Ok(());
    }

    conn.logger.log(
        LogLevel::Info,
        &format!(
            "Send on {} ({}) made no progress for {}s, waiting up to {}s more ({hint})",
            conn.id(),
            conn.uid(),
            SEND_WAIT.as_secs(),
            SEND_TIMEOUT.as_secs()
        ),
    );
    dump(socket);

    if poll.wait(Some(SEND_TIMEOUT))? {
        return Ok(());
    }

    conn.logger.log(
        LogLevel::Warn,
        &format!(
            "Send on {} ({}) timed out after {}s ({hint})",
            conn.id(),
            conn.uid(),
            (SEND_WAIT + SEND_TIMEOUT).as_secs()
        ),
    );
    Err(SendError::TimedOut(SEND_WAIT + SEND_TIMEOUT))
}

type Completion = io::Result<usize>;

struct SendRequest {
    data: Vec<u8>,
    done: SyncSender<Completion>,
}

/// Per-connection writer thread for completion based sends. Requests are
/// written in submission order.
pub(crate) struct SendWriter {
    tx: Option<Sender<SendRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl SendWriter {
    pub(crate) fn spawn(socket: Arc<Socket>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<SendRequest>();
        let thread = Builder::new()
            .name("mill-tcp-send".to_string())
            .spawn(move || writer_loop(&socket, rx))?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    fn submit(&self, data: &[u8]) -> Option<Receiver<Completion>> {
        let (done, completion) = mpsc::sync_channel(1);
        self.tx
            .as_ref()?
            .send(SendRequest {
                data: data.to_vec(),
                done,
            })
            .ok()?;
        Some(completion)
    }

    /// Closes the queue and joins the writer. The socket must already be shut
    /// down so a blocked write returns.
    pub(crate) fn finish(mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SendWriter {
    fn drop(&mut self) {
        self.tx.take();
    }
}

fn writer_loop(socket: &Socket, rx: Receiver<SendRequest>) {
    let mut poll: Option<SocketPoll> = None;
    while let Ok(request) = rx.recv() {
        let result = write_all(socket, &request.data, &mut poll);
        let _ = request.done.send(result);
    }
}

/// Reports how many bytes went out. An error after partial progress is
/// reported as the partial count.
fn write_all(socket: &Socket, data: &[u8], poll: &mut Option<SocketPoll>) -> Completion {
    let mut written = 0;
    while written < data.len() {
        match socket.send(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if poll.is_none() {
                    match SocketPoll::stream(socket, Interest::WRITABLE) {
                        Ok(p) => *poll = Some(p),
                        Err(e) => return if written > 0 { Ok(written) } else { Err(e) },
                    }
                }
                let waited = match poll.as_mut() {
                    Some(poll) => poll.wait(None),
                    None => Ok(false),
                };
                if let Err(e) = waited {
                    return if written > 0 { Ok(written) } else { Err(e) };
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return if written > 0 { Ok(written) } else { Err(e) },
        }
    }
    Ok(written)
}

pub(crate) fn send_completion(
    conn: &Connection,
    data: &[u8],
    hint: &str,
    dump: &dyn Fn(&Socket),
) -> std::result::Result<(), SendError> {
    let completion = {
        let _guard = conn.send_lock.lock();
        conn.with_writer(
            |socket: &Arc<Socket>,
             writer: &mut Option<SendWriter>|
             -> std::result::Result<Receiver<Completion>, SendError> {
                if writer.is_none() {
                    *writer = Some(SendWriter::spawn(socket.clone())?);
                }
                writer
                    .as_ref()
                    .and_then(|w| w.submit(data))
                    .ok_or(SendError::Disconnected)
            },
        )
        .ok_or(SendError::Disconnected)??
    };

    let result = match completion.recv_timeout(COMPLETION_WAIT) {
        Ok(result) => result,
        Err(RecvTimeoutError::Disconnected) => return Err(SendError::Disconnected),
        Err(RecvTimeoutError::Timeout) => wait_completion_slow(conn, &completion, hint, dump)?,
    };

    match result {
        Ok(sent) if sent == data.len() => Ok(()),
        Ok(sent) => {
            conn.logger.log(
                LogLevel::Warn,
                &format!(
                    "Send on {} ({}) completed with {sent} of {} bytes ({hint})",
                    conn.id(),
                    conn.uid(),
                    data.len()
                ),
            );
            Err(SendError::ShortWrite {
                sent,
                expected: data.len(),
            })
        }
        Err(e) => {
            conn.logger.log(
                LogLevel::Info,
                &format!(
                    "Send of {} bytes on {} ({}) failed: {e} ({hint})",
                    data.len(),
                    conn.id(),
                    conn.uid()
                ),
            );
            Err(SendError::Io(e))
        }
    }
}

fn wait_completion_slow(
    conn: &Connection,
    completion: &Receiver<Completion>,
    hint: &str,
    dump: &dyn Fn(&Socket),
) -> std::result::Result<Completion, SendError> {
    let _guard = conn.timeout_lock.lock();
    match completion.recv_timeout(COMPLETION_GRACE) {
        Ok(result) => return Ok(result),
        Err(RecvTimeoutError::Disconnected) => return Err(SendError::Disconnected),
        Err(RecvTimeoutError::Timeout) => {}
    }

    conn.logger.log(
        LogLevel::Info,
        &format!(
            "Send on {} ({}) has not completed after {}s ({hint})",
            conn.id(),
            conn.uid(),
            SEND_WAIT.as_secs()
        ),
    );

    let start = Instant::now();
    loop {
        if let Some(socket) = conn.socket() {
            dump(&socket);
        }
        match completion.recv_timeout(COMPLETION_RETRY) {
            Ok(result) => return Ok(result),
            Err(RecvTimeoutError::Disconnected) => return Err(SendError::Disconnected),
            Err(RecvTimeoutError::Timeout) => {}
        }
        if start.elapsed() >= SEND_TIMEOUT {
            conn.logger.log(
                LogLevel::Warn,
                &format!(
                    "Send on {} ({}) timed out after {}s ({hint})",
                    conn.id(),
                    conn.uid(),
                    (SEND_WAIT + SEND_TIMEOUT).as_secs()
                ),
            );
            return Err(SendError::TimedOut(SEND_WAIT + SEND_TIMEOUT));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::traits::NoOpLogger;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Connection, TcpStream) {
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

    fn no_dump(_socket: &Socket) {}

    #[test]
    fn test_blocking_send_nonblocking_socket() {
        let (conn, mut client) = pair();
        conn.socket().unwrap().set_nonblocking(true).unwrap();
        let data: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| i as u8).collect();

        let expected = data.clone();
        let reader = std::thread::spawn(move || {
            let mut received = vec![0u8; expected.len()];
            client.read_exact(&mut received).unwrap();
            received == expected
        });

        send_blocking(&conn, &data, "test", &no_dump).unwrap();
        assert!(reader.join().unwrap());
    }

    #[test]
    fn test_completion_send() {
        let (conn, mut client) = pair();
        send_completion(&conn, b"first", "test", &no_dump).unwrap();
        send_completion(&conn, b"second", "test", &no_dump).unwrap();

        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"firstsecond");

        let closed = conn.invalidate(crate::DisconnectReason::Shutdown).unwrap();
        closed.shutdown(&NoOpLogger, "test");
        closed.close(&NoOpLogger, "test");
    }

    #[test]
    fn test_send_on_invalid_socket() {
        let (conn, _client) = pair();
        drop(conn.invalidate(crate::DisconnectReason::Shutdown));
        assert!(matches!(
            send_blocking(&conn, b"x", "test", &no_dump),
            Err(SendError::Disconnected)
        ));
        assert!(matches!(
            send_completion(&conn, b"x", "test", &no_dump),
            Err(SendError::Disconnected)
        ));
    }
}
