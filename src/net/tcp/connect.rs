//! Outbound connections.

use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{NetworkError, Result};
use crate::net::tcp::traits::{ConnectionId, LogLevel, Logger};
use crate::net::tcp::BackendContext;
use crate::net::{addr, socket};

/// Connect wait for `localhost` and `127.0.0.1`.
pub const LOOPBACK_CONNECT_WAIT: Duration = Duration::from_millis(100);

pub const CONNECT_WAIT: Duration = Duration::from_millis(2000);

/// A connect that times out never returns sooner than this, so callers
/// retrying in a loop do not spin.
pub const MIN_CONNECT_WINDOW: Duration = Duration::from_millis(2000);

impl BackendContext {
    /// Connects to `host:port`, trying every resolved IPv4 address in turn.
    ///
    /// `on_connected` runs before this returns. If it returns `false` the
    /// connection is torn down again and [`NetworkError::Rejected`] is
    /// returned. When every address timed out or refused the connection the
    /// result is [`NetworkError::ConnectTimedOut`].
    pub fn connect<F>(&self, host: &str, port: u16, on_connected: F) -> Result<ConnectionId>
    where
        F: FnOnce(&BackendContext, ConnectionId, SocketAddr) -> bool,
    {
        let inner = &self.inner;
        let logger = &*inner.logger;
        let started = Instant::now();

        let addrs = addr::resolve_remote(host, port).map_err(|source| NetworkError::Resolve {
            host: host.to_string(),
            source,
        })?;
        if addrs.is_empty() {
            return Err(NetworkError::Resolve {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 address"),
            });
        }

        let wait = if addr::is_loopback_name(host) {
            LOOPBACK_CONNECT_WAIT
        } else {
            CONNECT_WAIT
        };

        let mut connected = None;
        for addr in addrs {
            match try_connect(logger, addr, wait) {
                Ok(socket) => {
                    connected = Some((socket, addr));
                    break;
                }
                Err(e) if is_retryable(&e) => {
                    logger.log(
                        LogLevel::Debug,
                        &format!("Connect to {addr} ({host}) did not complete ({e})"),
                    );
                }
                Err(source) => {
                    logger.log(
                        LogLevel::Info,
                        &format!("Connect to {addr} ({host}) failed ({source})"),
                    );
                    return Err(NetworkError::Connect { addr, source });
                }
            }
        }

        let Some((socket, addr)) = connected else {
            let elapsed = started.elapsed();
            if elapsed < MIN_CONNECT_WINDOW {
                thread::sleep(MIN_CONNECT_WINDOW - elapsed);
            }
            return Err(NetworkError::ConnectTimedOut {
                host: host.to_string(),
                port,
            });
        };

        let hint = "Connect";
        inner.prepare_socket(&socket, hint);
        let conn = inner.add_connection(socket, addr)?;
        let id = conn.id();
        logger.log(
            LogLevel::Debug,
            &format!("Connected {id} ({}) to {host}:{port} ({addr})", conn.uid()),
        );

        if !on_connected(self, id, addr) {
            inner.discard(&conn, "Rejected");
            return Err(NetworkError::Rejected(id));
        }
        Ok(id)
    }
}

fn try_connect(logger: &dyn Logger, addr: SocketAddr, wait: Duration) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&addr.into(), wait)?;
    #[cfg(unix)]
    probe(&socket)?;
    if !socket::set_blocking(logger, &socket, true, "Connect") {
        return Err(io::ErrorKind::Other.into());
    }
    Ok(socket)
}

/// A refused connect can still report writable; make sure there is a peer.
#[cfg(unix)]
fn probe(socket: &Socket) -> io::Result<()> {
    socket.peer_addr()?;
    socket.send(&[])?;
    Ok(())
}

/// Errors that count as "nobody answered" rather than a hard failure.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(is_retryable(&io::ErrorKind::ConnectionRefused.into()));
        assert!(is_retryable(&io::ErrorKind::TimedOut.into()));
        assert!(is_retryable(&io::ErrorKind::HostUnreachable.into()));
        assert!(!is_retryable(&io::ErrorKind::PermissionDenied.into()));
        assert!(!is_retryable(&io::ErrorKind::InvalidInput.into()));
    }

    #[test]
    fn test_connect_wait_by_host() {
        assert!(addr::is_loopback_name("localhost"));
        assert!(LOOPBACK_CONNECT_WAIT < CONNECT_WAIT);
        assert_eq!(MIN_CONNECT_WINDOW, Duration::from_millis(2000));
    }
}
