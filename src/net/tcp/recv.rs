//! Framed receive path for thread-per-connection mode.
//!
//! Reads go through a [`RecvCache`] so that small framed messages cost one
//! syscall for several headers and bodies, while large bodies are read
//! straight into their destination.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use mio::Interest;
use socket2::Socket;

use crate::net::socket;
use crate::net::tcp::connection::{Connection, MAX_HEADER_SIZE};
use crate::net::tcp::status::TransferCounters;
use crate::net::tcp::traits::{ConnectionId, DisconnectReason, HeaderAction, LogLevel};
use crate::poll::SocketPoll;

pub const RECV_CACHE_SIZE: usize = 128 * 1024;

/// How long a receive thread waits for its callbacks before giving up.
pub const READY_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum RecvFailure {
    /// The peer closed the stream.
    Closed,
    /// The receive timeout expired.
    TimedOut,
    Io(io::Error),
}

impl RecvFailure {
    pub fn reason(&self) -> DisconnectReason {
        match self {
            RecvFailure::Closed => DisconnectReason::Graceful,
            RecvFailure::TimedOut => DisconnectReason::TimedOut,
            RecvFailure::Io(_) => DisconnectReason::Error,
        }
    }
}

/// Where [`RecvCache::recv_exact`] pulls bytes from.
pub trait RecvSource {
    /// Non-blocking read; `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Called after a read reported `WouldBlock`.
    fn wait_readable(&mut self) -> Result<(), RecvFailure>;
}

/// Read-ahead buffer owned by one receive loop.
pub struct RecvCache {
    bytes: Box<[u8]>,
    byte_count: usize,
}

impl Default for RecvCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvCache {
    pub fn new() -> Self {
        Self::with_capacity(RECV_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity.max(1)].into_boxed_slice(),
            byte_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Unconsumed bytes held in the cache.
    pub fn len(&self) -> usize {
        self.byte_count
    }

    pub fn is_empty(&self) -> bool {
        self.byte_count == 0
    }

    /// Moves up to `dst.len()` bytes from the front of the cache into `dst`.
    pub fn take(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.byte_count);
        dst[..n].copy_from_slice(&self.bytes[..n]);
        self.bytes.copy_within(n..self.byte_count, 0);
        self.byte_count -= n;
        n
    }

    /// Fills `dst` completely, or with `allow_less` returns after the first
    /// read that delivered anything. Returns the number of bytes written.
    pub fn recv_exact<S>(
        &mut self,
        source: &mut S,
        dst: &mut [u8],
        allow_less: bool,
    ) -> Result<usize, RecvFailure>
    where
        S: RecvSource + ?Sized,
    {
        let len = dst.len();
        let mut filled = self.take(dst);
        if allow_less && filled > 0 {
            return Ok(filled);
        }

        while filled < len {
            // The cache is empty here, any leftovers went into dst above.
            let direct = len - filled >= self.capacity();
            let read = if direct {
                source.read(&mut dst[filled..])
            } else {
                source.read(&mut self.bytes[self.byte_count..])
            };

            match read {
                Ok(0) => return Err(RecvFailure::Closed),
                Ok(n) => {
                    if direct {
                        filled += n;
                    } else {
                        self.byte_count += n;
                        filled += self.take(&mut dst[filled..]);
                    }
                    if allow_less && filled < len {
                        return Ok(filled);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => source.wait_readable()?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RecvFailure::Io(e)),
            }
        }
        Ok(len)
    }
}

/// Socket backed source that waits with a readiness poll bounded by the
/// connection's receive timeout.
struct SocketSource<'a> {
    conn: &'a Connection,
    socket: &'a Socket,
    poll: SocketPoll,
    hint: &'a str,
}

impl RecvSource for SocketSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.socket;
        socket.read(buf)
    }

    fn wait_readable(&mut self) -> Result<(), RecvFailure> {
        loop {
            let (timeout, handler) = self.conn.recv_timeout();
            match self.poll.wait(Some(timeout)) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if let Some(handler) = handler {
                        if handler.on_recv_timeout(self.conn.id(), timeout, self.hint) {
                            continue;
                        }
                    } else {
                        self.conn.logger.log(
                            LogLevel::Info,
                            &format!(
                                "Recv on {} ({}) timed out after {:?} ({})",
                                self.conn.id(),
                                self.conn.uid(),
                                timeout,
                                self.hint
                            ),
                        );
                    }
                    return Err(RecvFailure::TimedOut);
                }
                Err(e) => return Err(RecvFailure::Io(e)),
            }
        }
    }
}

/// Body of a connection's receive thread. Returns once the connection is
/// gone; the disconnect handler has fired by then.
pub(crate) fn run_recv_thread(conn: Arc<Connection>, counters: Arc<TransferCounters>) {
    let reason = recv_loop(&conn, &counters);

    let logger = conn.logger.clone();
    let closed = conn.invalidate(reason);
    conn.fire_disconnect(reason);
    if let Some(closed) = closed {
        closed.shutdown(&*logger, "recv thread exit");
        closed.close(&*logger, "recv thread exit");
    }
}

fn recv_loop(conn: &Connection, counters: &TransferCounters) -> DisconnectReason {
    let logger = &*conn.logger;

    if !conn.ready.wait_timeout(READY_WAIT) {
        logger.log(
            LogLevel::Warn,
            &format!(
                "Timed out after {}s waiting for recv callbacks on {} ({})",
                READY_WAIT.as_secs(),
                conn.id(),
                conn.uid()
            ),
        );
        return DisconnectReason::TimedOut;
    }

    let Some(socket) = conn.socket() else {
        return DisconnectReason::Shutdown;
    };
    if !socket::set_blocking(logger, &socket, false, "recv thread") {
        return DisconnectReason::Error;
    }
    let poll = match SocketPoll::stream(&socket, Interest::READABLE) {
        Ok(poll) => poll,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("Failed to create recv poll for {} ({e})", conn.id()),
            );
            return DisconnectReason::Error;
        }
    };

    let hint = conn.recv_settings().hint;
    let mut source = SocketSource {
        conn,
        socket: &socket,
        poll,
        hint: &hint,
    };
    let mut cache = RecvCache::new();
    let mut header_buf = [0u8; MAX_HEADER_SIZE];
    let mut first_call = true;

    loop {
        let settings = conn.recv_settings();
        let Some(frame) = settings.frame else {
            return DisconnectReason::Shutdown;
        };
        let header = &mut header_buf[..settings.header_size.min(MAX_HEADER_SIZE)];

        if let Err(failure) = cache.recv_exact(&mut source, header, false) {
            log_failure(conn, &failure, first_call, "header", &settings.hint);
            return failure.reason();
        }
        first_call = false;
        counters.add_recv(header.len());

        let mut body = match frame.on_header(conn.id(), header) {
            HeaderAction::Continue => continue,
            HeaderAction::Disconnect => return DisconnectReason::Declined,
            HeaderAction::Body(body) if body.is_empty() => continue,
            HeaderAction::Body(body) => body,
        };

        match cache.recv_exact(&mut source, &mut body, settings.allow_less) {
            Ok(n) => {
                body.truncate(n);
                counters.add_recv(n);
                if !frame.on_body(conn.id(), header, body, false) {
                    return DisconnectReason::Declined;
                }
            }
            Err(failure) => {
                log_failure(conn, &failure, false, "body", &settings.hint);
                frame.on_body(conn.id(), header, body, true);
                return failure.reason();
            }
        }
    }
}

fn log_failure(conn: &Connection, failure: &RecvFailure, first_call: bool, what: &str, hint: &str) {
    let id: ConnectionId = conn.id();
    let (level, message) = match failure {
        RecvFailure::Closed => (
            LogLevel::Debug,
            format!("{id} ({}) closed by peer while reading {what} ({hint})", conn.uid()),
        ),
        RecvFailure::TimedOut => return,
        RecvFailure::Io(e) => {
            let quiet = first_call
                || matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                );
            (
                if quiet { LogLevel::Info } else { LogLevel::Warn },
                format!("{id} ({}) recv error while reading {what}: {e} ({hint})", conn.uid()),
            )
        }
    };
    conn.logger.log(level, &message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    /// In-memory stream that hands out data in fixed chunks and reports
    /// `WouldBlock` between them when asked to.
    struct ChunkedSource {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        stalls: VecDeque<bool>,
        waits: usize,
        reads: usize,
    }

    impl ChunkedSource {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                pos: 0,
                chunk: chunk.max(1),
                stalls: VecDeque::new(),
                waits: 0,
                reads: 0,
            }
        }
    }

    impl RecvSource for ChunkedSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.stalls.pop_front().unwrap_or(false) {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.reads += 1;
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn wait_readable(&mut self) -> Result<(), RecvFailure> {
            self.waits += 1;
            Ok(())
        }
    }

    #[test]
    fn test_small_reads_go_through_cache() {
        let data: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let mut source = ChunkedSource::new(data.clone(), 4096);
        let mut cache = RecvCache::with_capacity(256);

        let mut header = [0u8; 8];
        assert_eq!(cache.recv_exact(&mut source, &mut header, false).unwrap(), 8);
        assert_eq!(&header, &data[..8]);
        // one read filled the cache
        assert_eq!(source.reads, 1);
        assert_eq!(cache.len(), 256 - 8);

        let mut body = [0u8; 100];
        cache.recv_exact(&mut source, &mut body, false).unwrap();
        assert_eq!(&body[..], &data[8..108]);
        assert_eq!(source.reads, 1);
    }

    #[test]
    fn test_large_reads_bypass_cache() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let mut source = ChunkedSource::new(data.clone(), 4096);
        let mut cache = RecvCache::with_capacity(256);

        let mut body = vec![0u8; 1024];
        cache.recv_exact(&mut source, &mut body, false).unwrap();
        assert_eq!(&body[..], &data[..1024]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_would_block_waits() {
        let mut source = ChunkedSource::new(vec![7u8; 16], 4);
        source.stalls = VecDeque::from(vec![true, false, true, false]);
        let mut cache = RecvCache::with_capacity(8);
        let mut dst = [0u8; 16];
        assert_eq!(cache.recv_exact(&mut source, &mut dst, false).unwrap(), 16);
        assert_eq!(source.waits, 2);
        assert_eq!(dst, [7u8; 16]);
    }

    #[test]
    fn test_closed_stream() {
        let mut source = ChunkedSource::new(vec![1, 2, 3], 8);
        let mut cache = RecvCache::with_capacity(64);
        let mut dst = [0u8; 8];
        assert!(matches!(
            cache.recv_exact(&mut source, &mut dst, false),
            Err(RecvFailure::Closed)
        ));
    }

    #[test]
    fn test_allow_less_returns_partial() {
        let mut source = ChunkedSource::new(vec![9u8; 100], 30);
        let mut cache = RecvCache::with_capacity(16);
        let mut dst = [0u8; 100];
        assert_eq!(cache.recv_exact(&mut source, &mut dst, true).unwrap(), 30);
        assert_eq!(&dst[..30], &[9u8; 30]);

        // leftovers in the cache are enough without another read
        let mut source = ChunkedSource::new(vec![5u8; 20], 64);
        let mut cache = RecvCache::with_capacity(64);
        let mut header = [0u8; 8];
        cache.recv_exact(&mut source, &mut header, false).unwrap();
        let mut body = [0u8; 50];
        assert_eq!(cache.recv_exact(&mut source, &mut body, true).unwrap(), 12);
        assert_eq!(source.reads, 1);
    }

    #[test]
    fn test_empty_destination() {
        let mut source = ChunkedSource::new(Vec::new(), 8);
        let mut cache = RecvCache::new();
        assert_eq!(cache.recv_exact(&mut source, &mut [], false).unwrap(), 0);
        assert_eq!(source.reads, 0);
    }

    #[test]
    fn test_io_error_and_reason() {
        struct Broken;
        impl RecvSource for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
            fn wait_readable(&mut self) -> Result<(), RecvFailure> {
                Ok(())
            }
        }
        let mut cache = RecvCache::with_capacity(8);
        let failure = cache
            .recv_exact(&mut Broken, &mut [0u8; 4], false)
            .unwrap_err();
        assert_eq!(failure.reason(), DisconnectReason::Error);
        assert_eq!(RecvFailure::Closed.reason(), DisconnectReason::Graceful);
        assert_eq!(RecvFailure::TimedOut.reason(), DisconnectReason::TimedOut);
    }

    proptest! {
        /// Any sequence of request sizes over any chunking yields the original
        /// byte stream, and the cache never holds more than its capacity.
        #[test]
        fn prop_cache_preserves_stream(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            requests in proptest::collection::vec(1usize..300, 1..64),
            chunk in 1usize..512,
            capacity in 1usize..200,
            stalls in proptest::collection::vec(any::<bool>(), 0..32),
        ) {
            let mut source = ChunkedSource::new(data.clone(), chunk);
            source.stalls = stalls.into_iter().collect();
            let mut cache = RecvCache::with_capacity(capacity);
            let mut out = Vec::new();

            for size in requests {
                let size = size.min(data.len() - out.len());
                if size == 0 {
                    break;
                }
                let mut buf = vec![0u8; size];
                let n = cache.recv_exact(&mut source, &mut buf, false).unwrap();
                prop_assert_eq!(n, size);
                prop_assert!(cache.len() <= cache.capacity());
                out.extend_from_slice(&buf);
            }
            prop_assert_eq!(&out[..], &data[..out.len()]);
        }
    }
}
