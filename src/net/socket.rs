//! Socket option and lifecycle helpers.
//!
//! Every helper reports failures through the injected [`Logger`] together with
//! a caller supplied hint and returns `false`, so the call sites can decide
//! whether a failed option is fatal. None of them panic.

use std::io;
use std::net::Shutdown;
use std::time::Duration;

use socket2::{Socket, TcpKeepalive};

use crate::net::tcp::traits::{LogLevel, Logger};

pub(crate) const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const KEEPALIVE_PROBES: u32 = 10;

/// Linger applied to outgoing and accepted sockets on Apple platforms.
pub(crate) const LINGER_SECONDS: u32 = 10;

pub fn set_blocking(logger: &dyn Logger, socket: &Socket, blocking: bool, hint: &str) -> bool {
    match socket.set_nonblocking(!blocking) {
        Ok(()) => true,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("Failed to set socket blocking={blocking} ({e}) - {hint}"),
            );
            false
        }
    }
}

/// Enables SO_KEEPALIVE with a short probe cadence so a dead peer surfaces as
/// a socket error within a couple of minutes.
pub fn set_keep_alive(logger: &dyn Logger, socket: &Socket, hint: &str) -> bool {
    if let Err(e) = socket.set_keepalive(true) {
        logger.log(
            LogLevel::Error,
            &format!("setsockopt SO_KEEPALIVE failed ({e}) - {hint}"),
        );
        return false;
    }

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        windows
    ))]
    let keepalive = keepalive.with_interval(KEEPALIVE_INTERVAL);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd"
    ))]
    let keepalive = keepalive.with_retries(KEEPALIVE_PROBES);

    match socket.set_tcp_keepalive(&keepalive) {
        Ok(()) => true,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("setsockopt TCP keep-alive timings failed ({e}) - {hint}"),
            );
            false
        }
    }
}

/// Sets TCP_NODELAY. A no-op on macOS.
pub fn disable_nagle(logger: &dyn Logger, socket: &Socket, hint: &str) -> bool {
    if cfg!(target_os = "macos") {
        return true;
    }
    match socket.set_nodelay(true) {
        Ok(()) => true,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("setsockopt TCP_NODELAY failed ({e}) - {hint}"),
            );
            false
        }
    }
}

/// Only applied on Apple platforms; other systems release the sockets of a
/// crashed process on their own.
pub fn set_linger(logger: &dyn Logger, socket: &Socket, seconds: u32, hint: &str) -> bool {
    if !cfg!(any(target_os = "macos", target_os = "ios")) {
        return true;
    }
    match socket.set_linger(Some(Duration::from_secs(u64::from(seconds)))) {
        Ok(()) => true,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("setsockopt SO_LINGER failed ({e}) - {hint}"),
            );
            false
        }
    }
}

/// Sets both SO_SNDTIMEO and SO_RCVTIMEO.
pub fn set_timeout(logger: &dyn Logger, socket: &Socket, timeout: Duration, hint: &str) -> bool {
    let timeout = (!timeout.is_zero()).then_some(timeout);
    if let Err(e) = socket.set_write_timeout(timeout) {
        logger.log(
            LogLevel::Error,
            &format!("setsockopt SO_SNDTIMEO failed ({e}) - {hint}"),
        );
        return false;
    }
    if let Err(e) = socket.set_read_timeout(timeout) {
        logger.log(
            LogLevel::Error,
            &format!("setsockopt SO_RCVTIMEO failed ({e}) - {hint}"),
        );
        return false;
    }
    true
}

pub fn set_recv_buf(logger: &dyn Logger, socket: &Socket, size: usize, hint: &str) -> bool {
    match socket.set_recv_buffer_size(size) {
        Ok(()) => true,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("setsockopt SO_RCVBUF failed ({e}) - {hint}"),
            );
            false
        }
    }
}

pub fn set_send_buf(logger: &dyn Logger, socket: &Socket, size: usize, hint: &str) -> bool {
    match socket.set_send_buffer_size(size) {
        Ok(()) => true,
        Err(e) => {
            logger.log(
                LogLevel::Error,
                &format!("setsockopt SO_SNDBUF failed ({e}) - {hint}"),
            );
            false
        }
    }
}

/// Shuts down both directions. `None` and not-connected sockets count as
/// success.
pub fn shutdown_socket(logger: &dyn Logger, socket: Option<&Socket>, hint: &str) -> bool {
    let Some(socket) = socket else {
        return true;
    };
    match socket.shutdown(Shutdown::Both) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
            logger.log(
                LogLevel::Debug,
                &format!("Socket shutdown on unconnected socket - {hint}"),
            );
            true
        }
        Err(e) => {
            logger.log(
                LogLevel::Info,
                &format!("Failed to shutdown socket ({e}) - {hint}"),
            );
            false
        }
    }
}

/// Consumes and closes the socket. `None` counts as success.
pub fn close_socket(logger: &dyn Logger, socket: Option<Socket>, hint: &str) -> bool {
    if let Some(socket) = socket {
        logger.log(LogLevel::Debug, &format!("Closing socket - {hint}"));
        drop(socket);
    }
    true
}

/// Logs whatever the platform exposes about the socket.
pub fn log_tcp_info(logger: &dyn Logger, socket: &Socket, hint: &str) -> bool {
    let mut info = Vec::new();
    if let Some(addr) = socket.local_addr().ok().and_then(|a| a.as_socket()) {
        info.push(format!("local={addr}"));
    }
    if let Some(addr) = socket.peer_addr().ok().and_then(|a| a.as_socket()) {
        info.push(format!("peer={addr}"));
    }
    match socket.take_error() {
        Ok(Some(e)) => info.push(format!("pending_error={e}")),
        Ok(None) => info.push("pending_error=none".to_string()),
        Err(_) => {}
    }
    if let Ok(size) = socket.send_buffer_size() {
        info.push(format!("sndbuf={size}"));
    }
    if let Ok(size) = socket.recv_buffer_size() {
        info.push(format!("rcvbuf={size}"));
    }
    if let Ok(nodelay) = socket.nodelay() {
        info.push(format!("nodelay={nodelay}"));
    }

    if info.is_empty() {
        logger.log(
            LogLevel::Info,
            &format!("  TcpInfo unavailable - {hint}"),
        );
        return false;
    }
    logger.log(
        LogLevel::Info,
        &format!("  TcpInfo {} - {hint}", info.join(" ")),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::traits::test_support::CaptureLogger;
    use crate::net::tcp::traits::NoOpLogger;
    use socket2::{Domain, Protocol, Type};
    use std::net::{TcpListener, TcpStream};

    fn connected_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Socket::from(server), client)
    }

    #[test]
    fn test_invalid_handles_are_trivial_success() {
        let logger = NoOpLogger;
        assert!(shutdown_socket(&logger, None, "test"));
        assert!(shutdown_socket(&logger, None, "test"));
        assert!(close_socket(&logger, None, "test"));
        assert!(close_socket(&logger, None, "test"));
    }

    #[test]
    fn test_options_on_connected_socket() {
        let logger = NoOpLogger;
        let (socket, _peer) = connected_pair();
        assert!(set_keep_alive(&logger, &socket, "test"));
        assert!(disable_nagle(&logger, &socket, "test"));
        assert!(set_linger(&logger, &socket, LINGER_SECONDS, "test"));
        assert!(set_timeout(&logger, &socket, Duration::from_secs(1), "test"));
        assert!(set_recv_buf(&logger, &socket, 64 * 1024, "test"));
        assert!(set_send_buf(&logger, &socket, 64 * 1024, "test"));
        assert!(set_blocking(&logger, &socket, false, "test"));
        assert!(set_blocking(&logger, &socket, true, "test"));
        assert!(socket.keepalive().unwrap());
    }

    #[test]
    fn test_shutdown_twice() {
        let logger = NoOpLogger;
        let (socket, _peer) = connected_pair();
        assert!(shutdown_socket(&logger, Some(&socket), "first"));
        // A second shutdown either succeeds or reports not-connected.
        assert!(shutdown_socket(&logger, Some(&socket), "second"));
        assert!(close_socket(&logger, Some(socket), "close"));
    }

    #[test]
    fn test_shutdown_unconnected_socket() {
        let logger = CaptureLogger::default();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        assert!(shutdown_socket(&logger, Some(&socket), "fresh"));
        assert_eq!(logger.lines.lock()[0].0, LogLevel::Debug);
    }

    #[test]
    fn test_log_tcp_info() {
        let logger = CaptureLogger::default();
        let (socket, _peer) = connected_pair();
        assert!(log_tcp_info(&logger, &socket, "info"));
        let lines = logger.lines.lock();
        assert!(lines[0].1.contains("peer=127.0.0.1:"));
    }
}
