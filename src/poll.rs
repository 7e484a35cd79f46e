use std::{
    collections::HashMap,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use mio::{event::Source, Events, Interest, Poll, Registry, Token};
use parking_lot::RwLock;
use socket2::Socket;

use crate::handler::EventHandler;

pub(crate) type HandlerMap = HashMap<Token, Arc<dyn EventHandler>>;

/// Registration side of a reactor: the mio registry plus the handler table
/// the poll thread dispatches through.
///
/// The `Poll` itself is owned by the poll thread; registrations go through a
/// cloned [`Registry`] so they can happen while the poll thread is blocked.
pub struct PollHandle {
    registry: Registry,
    handlers: RwLock<HandlerMap>,
}

impl PollHandle {
    pub fn new(poll: &Poll) -> io::Result<Self> {
        Ok(Self {
            registry: poll.registry().try_clone()?,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// The handler is installed before the source is registered so the first
    /// edge cannot be lost.
    pub fn register<S>(
        &self,
        src: &mut S,
        token: Token,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.handlers.write().insert(token, handler);
        if let Err(e) = self.registry.register(src, token, interest) {
            self.handlers.write().remove(&token);
            return Err(e);
        }
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.handlers.write().remove(&token);
        self.registry.deregister(src)
    }

    pub fn handler(&self, token: Token) -> Option<Arc<dyn EventHandler>> {
        self.handlers.read().get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) -> HandlerMap {
        std::mem::take(&mut *self.handlers.write())
    }
}

const SOCKET_TOKEN: Token = Token(1);

enum Polled {
    Stream(mio::net::TcpStream),
    Listener(mio::net::TcpListener),
}

/// Readiness wait on a single socket.
///
/// Registers a duplicate of the socket's handle with a private `Poll`, so the
/// original stays usable through `socket2`. The socket is switched to
/// non-blocking mode.
pub struct SocketPoll {
    poll: Poll,
    events: Events,
    _source: Polled,
}

impl SocketPoll {
    pub fn stream(socket: &Socket, interest: Interest) -> io::Result<Self> {
        let dup = socket.try_clone()?;
        dup.set_nonblocking(true)?;
        let mut stream = mio::net::TcpStream::from_std(std::net::TcpStream::from(dup));
        let poll = Poll::new()?;
        poll.registry().register(&mut stream, SOCKET_TOKEN, interest)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(4),
            _source: Polled::Stream(stream),
        })
    }

    pub fn listener(socket: &Socket) -> io::Result<Self> {
        let dup = socket.try_clone()?;
        dup.set_nonblocking(true)?;
        let mut listener = mio::net::TcpListener::from_std(std::net::TcpListener::from(dup));
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, SOCKET_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(4),
            _source: Polled::Listener(listener),
        })
    }

    /// `Ok(true)` when the socket reported readiness (including hang-up and
    /// error), `Ok(false)` when `timeout` elapsed first. `None`, or a timeout
    /// too large to express as an `Instant`, waits forever.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, remaining) {
                Ok(()) => {
                    if !self.events.is_empty() {
                        return Ok(true);
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(false);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ReadinessEvent;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    struct Nop;
    impl EventHandler for Nop {
        fn handle_event(&self, _event: &ReadinessEvent) {}
    }

    #[test]
    fn test_poll_handle_register() {
        let poll = Poll::new().unwrap();
        let handle = PollHandle::new(&poll).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let mut listener = mio::net::TcpListener::from_std(listener);

        handle
            .register(&mut listener, Token(5), Interest::READABLE, Arc::new(Nop))
            .unwrap();
        assert_eq!(handle.len(), 1);
        assert!(handle.handler(Token(5)).is_some());

        handle.deregister(&mut listener, Token(5)).unwrap();
        assert!(handle.is_empty());
    }

    #[test]
    fn test_socket_poll_timeout_then_readable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let server = Socket::from(server);

        let mut poll = SocketPoll::stream(&server, Interest::READABLE).unwrap();
        assert!(!poll.wait(Some(Duration::from_millis(50))).unwrap());

        client.write_all(b"ping").unwrap();
        assert!(poll.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn test_socket_poll_unbounded_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let server = Socket::from(server);

        let mut poll = SocketPoll::stream(&server, Interest::READABLE).unwrap();
        drop(client);
        assert!(poll.wait(Some(Duration::MAX)).unwrap());
    }

    #[test]
    fn test_listener_poll_sees_pending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = Socket::from(listener);
        let mut poll = SocketPoll::listener(&socket).unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        assert!(poll.wait(Some(Duration::from_secs(5))).unwrap());
    }
}
