//! Accept path.
//!
//! Every listen address gets a [`ListenEntry`] and its own accept thread. The
//! thread binds, reports readiness through the entry, then waits on the
//! listen socket in 5 s slices so a stop request is noticed even when no
//! client ever connects. `stop_listen` additionally connects to the listener
//! to cut that wait short.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Builder, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{NetworkError, Result};
use crate::net::tcp::traits::{ConnectionId, LogLevel, Logger};
use crate::net::tcp::{BackendContext, BackendInner};
use crate::net::{addr, socket};
use crate::poll::SocketPoll;
use crate::signal::Signal;

/// How long `start_listen` waits for all new listeners to come up.
pub const LISTEN_READY_WAIT: Duration = Duration::from_millis(4000);

/// Readiness wait of the accept loop between stop checks.
pub const ACCEPT_POLL: Duration = Duration::from_secs(5);

pub const LISTEN_BACKLOG: i32 = 128;

const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

enum ListenOutcome {
    Pending,
    Listening(SocketAddr),
    Failed(Option<NetworkError>),
}

pub(crate) struct ListenEntry {
    ip: String,
    port: u16,
    ready: Signal,
    stopped: AtomicBool,
    outcome: Mutex<ListenOutcome>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ListenEntry {
    fn new(ip: String, port: u16) -> Self {
        Self {
            ip,
            port,
            ready: Signal::new(),
            stopped: AtomicBool::new(false),
            outcome: Mutex::new(ListenOutcome::Pending),
            thread: Mutex::new(None),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn listening(&self, addr: SocketAddr) {
        *self.outcome.lock() = ListenOutcome::Listening(addr);
        self.ready.set();
    }

    fn fail(&self, error: NetworkError) {
        *self.outcome.lock() = ListenOutcome::Failed(Some(error));
        self.ready.set();
    }

    fn take_failure(&self) -> Option<NetworkError> {
        match &mut *self.outcome.lock() {
            ListenOutcome::Failed(error) => Some(error.take().unwrap_or_else(|| {
                NetworkError::Io(io::Error::other("listen failed"))
            })),
            _ => None,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.outcome.lock() {
            ListenOutcome::Listening(addr) => Some(*addr),
            _ => None,
        }
    }

    fn join(&self, logger: &dyn Logger) {
        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            logger.log(
                LogLevel::Error,
                &format!("Accept thread for {}:{} panicked", self.ip, self.port),
            );
        }
    }
}

impl BackendContext {
    /// Starts accepting on `bind_ip:port`, or on every local IPv4 address plus
    /// loopback when `bind_ip` is empty.
    ///
    /// Returns once every new listener is accepting. Listeners that failed to
    /// bind are dropped and the first failure is returned; the others keep
    /// running. `on_connected` runs on the accept thread for every new
    /// connection; returning `false` closes it again.
    pub fn start_listen<F>(&self, port: u16, bind_ip: &str, on_connected: F) -> Result<()>
    where
        F: Fn(&BackendContext, ConnectionId, SocketAddr) -> bool + Send + Sync + 'static,
    {
        let logger = &*self.inner.logger;
        let ips = if bind_ip.is_empty() {
            addr::local_listen_addresses(logger)
        } else {
            vec![bind_ip.to_string()]
        };
        if ips.is_empty() {
            return Err(NetworkError::NoListenAddresses);
        }

        let on_connected = Arc::new(on_connected);
        let mut started: Vec<Arc<ListenEntry>> = Vec::with_capacity(ips.len());
        for ip in ips {
            let entry = Arc::new(ListenEntry::new(ip, port));
            let spawned = Builder::new().name("mill-tcp-listen".to_string()).spawn({
                let ctx = self.clone();
                let entry = entry.clone();
                let on_connected = on_connected.clone();
                move || accept_thread(&ctx, &entry, &*on_connected)
            });
            match spawned {
                Ok(handle) => *entry.thread.lock() = Some(handle),
                Err(source) => {
                    for entry in &started {
                        wake_and_join(logger, entry);
                    }
                    return Err(NetworkError::Thread {
                        name: "mill-tcp-listen".to_string(),
                        source,
                    });
                }
            }
            started.push(entry);
        }

        let deadline = Instant::now() + LISTEN_READY_WAIT;
        let mut first_error = None;
        let mut kept = Vec::with_capacity(started.len());
        for entry in started {
            if !entry
                .ready
                .wait_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                logger.log(
                    LogLevel::Warn,
                    &format!(
                        "Listener on {}:{} not ready after {LISTEN_READY_WAIT:?}",
                        entry.ip, entry.port
                    ),
                );
                // Still running; kept so stop_listen joins it.
                entry.stop();
                first_error.get_or_insert(NetworkError::ListenTimeout(LISTEN_READY_WAIT));
                kept.push(entry);
                continue;
            }
            match entry.take_failure() {
                Some(error) => {
                    entry.join(logger);
                    first_error.get_or_insert(error);
                }
                None => kept.push(entry),
            }
        }

        self.inner.listen_entries.lock().extend(kept);
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Stops every accept thread and waits for them to exit.
    pub fn stop_listen(&self) {
        self.inner.stop_listen();
    }

    /// Addresses currently accepting, with the actual port when listening on
    /// port 0.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .listen_entries
            .lock()
            .iter()
            .filter_map(|entry| entry.local_addr())
            .collect()
    }
}

impl BackendInner {
    pub(crate) fn stop_listen(&self) {
        let entries = std::mem::take(&mut *self.listen_entries.lock());
        if entries.is_empty() {
            return;
        }
        let logger = &*self.logger;
        for entry in &entries {
            entry.stop();
        }
        for entry in &entries {
            wake_and_join(logger, entry);
        }
        logger.log(
            LogLevel::Debug,
            &format!("Stopped {} listener(s)", entries.len()),
        );
    }
}

/// Connects to the listener so its readiness wait returns right away, then
/// joins the accept thread.
fn wake_and_join(logger: &dyn Logger, entry: &ListenEntry) {
    entry.stop();
    if let Some(local) = entry.local_addr() {
        let wake = addr::wake_address(local);
        if let Err(e) = TcpStream::connect_timeout(&wake, WAKE_CONNECT_TIMEOUT) {
            logger.log(
                LogLevel::Debug,
                &format!("Wake-up connect to {wake} failed ({e})"),
            );
        }
    }
    entry.join(logger);
}

fn accept_thread<F>(ctx: &BackendContext, entry: &ListenEntry, on_connected: &F)
where
    F: Fn(&BackendContext, ConnectionId, SocketAddr) -> bool,
{
    let logger = &*ctx.inner.logger;
    let (listener, local) = match bind_listener(logger, entry) {
        Ok(bound) => bound,
        Err(e) => {
            entry.fail(e);
            return;
        }
    };
    let mut poll = match SocketPoll::listener(&listener) {
        Ok(poll) => poll,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("Failed to poll listen socket {local} ({e})"),
            );
            entry.fail(NetworkError::Io(e));
            socket::close_socket(logger, Some(listener), "Listen");
            return;
        }
    };
    entry.listening(local);
    logger.log(LogLevel::Info, &format!("Listening on {local}"));

    accept_loop(ctx, entry, &listener, &mut poll, on_connected);

    drop(poll);
    socket::close_socket(logger, Some(listener), "Listen");
    logger.log(LogLevel::Debug, &format!("Stopped listening on {local}"));
}

fn bind_listener(logger: &dyn Logger, entry: &ListenEntry) -> Result<(Socket, SocketAddr)> {
    let addr = addr::resolve_listen(&entry.ip, entry.port).map_err(|source| {
        NetworkError::Resolve {
            host: entry.ip.clone(),
            source,
        }
    })?;

    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    // On Windows SO_REUSEADDR lets a second listener steal a bound port, so
    // an occupied address would no longer fail with AddrInUse there.
    #[cfg(not(windows))]
    listener.set_reuse_address(true)?;

    if let Err(e) = listener.bind(&addr.into()) {
        if e.kind() == io::ErrorKind::AddrInUse {
            logger.log(
                LogLevel::Info,
                &format!("Bind {addr} failed because address/port is in use"),
            );
            return Err(NetworkError::AddrInUse {
                addr: addr.to_string(),
            });
        }
        logger.log(LogLevel::Error, &format!("Bind {addr} failed ({e})"));
        return Err(NetworkError::Bind {
            addr: addr.to_string(),
            source: e,
        });
    }
    listener.listen(LISTEN_BACKLOG)?;
    socket::set_keep_alive(logger, &listener, "Listen");

    let local = listener
        .local_addr()?
        .as_socket()
        .unwrap_or(addr);
    Ok((listener, local))
}

fn accept_loop<F>(
    ctx: &BackendContext,
    entry: &ListenEntry,
    listener: &Socket,
    poll: &mut SocketPoll,
    on_connected: &F,
) where
    F: Fn(&BackendContext, ConnectionId, SocketAddr) -> bool,
{
    let logger = &*ctx.inner.logger;
    while !entry.is_stopped() {
        if let Err(e) = poll.wait(Some(ACCEPT_POLL)) {
            logger.log(LogLevel::Error, &format!("Listen poll failed ({e})"));
            break;
        }
        // The listen socket is non-blocking; drain everything queued.
        while !entry.is_stopped() {
            match listener.accept() {
                Ok((socket, peer)) => {
                    let Some(peer) = peer.as_socket() else {
                        socket::close_socket(logger, Some(socket), "Accept");
                        continue;
                    };
                    on_accepted(ctx, socket, peer, on_connected);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    logger.log(LogLevel::Warn, &format!("Accept failed ({e})"));
                    break;
                }
            }
        }
    }
}

fn on_accepted<F>(ctx: &BackendContext, socket: Socket, peer: SocketAddr, on_connected: &F)
where
    F: Fn(&BackendContext, ConnectionId, SocketAddr) -> bool,
{
    let inner = &ctx.inner;
    let logger = &*inner.logger;
    let hint = "Accept";

    if !socket::set_blocking(logger, &socket, true, hint) {
        socket::close_socket(logger, Some(socket), hint);
        return;
    }
    inner.prepare_socket(&socket, hint);

    let conn = match inner.add_connection(socket, peer) {
        Ok(conn) => conn,
        Err(e) => {
            logger.log(
                LogLevel::Warn,
                &format!("Dropping connection from {peer} ({e})"),
            );
            return;
        }
    };
    logger.log(
        LogLevel::Debug,
        &format!("Accepted {} ({}) from {peer}", conn.id(), conn.uid()),
    );

    if !on_connected(ctx, conn.id(), peer) {
        logger.log(
            LogLevel::Debug,
            &format!("{} from {peer} rejected by connected callback", conn.id()),
        );
        inner.discard(&conn, "Rejected");
    }
}
