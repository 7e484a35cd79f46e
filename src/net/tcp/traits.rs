use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

/// Unique identifier for connections
///
/// Handed out by the backend when a connection is accepted or established and
/// never reused for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side of the stream.
    Graceful,
    /// A header or body callback asked to stop.
    Declined,
    /// The receive timeout expired and nobody asked to keep waiting.
    TimedOut,
    /// A socket error ended the connection.
    Error,
    /// Local shutdown, deletion or backend teardown.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Graceful => "graceful",
            DisconnectReason::Declined => "declined",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::Error => "error",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// What the receive path should do after a header has been read.
#[derive(Debug)]
pub enum HeaderAction {
    /// The message has no body; go back to reading headers.
    Continue,
    /// Read exactly `body.len()` bytes into this buffer, then call
    /// [`FrameHandler::on_body`].
    Body(Vec<u8>),
    /// Stop receiving and disconnect.
    Disconnect,
}

/// Receives the framed messages of one connection.
///
/// Both methods run on the connection's receive thread (or a reactor worker)
/// and are never called concurrently for the same connection.
pub trait FrameHandler: Send + Sync {
    /// Called with the fixed-size header of each message.
    fn on_header(&self, conn_id: ConnectionId, header: &[u8]) -> HeaderAction;

    /// Called once the body requested by [`HeaderAction::Body`] has arrived.
    ///
    /// `failed` is set when the body could not be read completely; the
    /// connection is torn down afterwards regardless of the return value.
    /// Returning `false` disconnects.
    fn on_body(&self, conn_id: ConnectionId, header: &[u8], body: Vec<u8>, failed: bool) -> bool;
}

/// Called exactly once per connection when it goes away.
pub trait DisconnectHandler: Send + Sync {
    fn on_disconnect(&self, conn_id: ConnectionId, uid: Uuid, reason: DisconnectReason);
}

impl<F> DisconnectHandler for F
where
    F: Fn(ConnectionId, Uuid, DisconnectReason) + Send + Sync,
{
    fn on_disconnect(&self, conn_id: ConnectionId, uid: Uuid, reason: DisconnectReason) {
        self(conn_id, uid, reason)
    }
}

/// Consulted when no data arrived within the connection's receive timeout.
/// Return `true` to keep waiting for another period.
pub trait RecvTimeoutHandler: Send + Sync {
    fn on_recv_timeout(&self, conn_id: ConnectionId, timeout: Duration, hint: &str) -> bool;
}

impl<F> RecvTimeoutHandler for F
where
    F: Fn(ConnectionId, Duration, &str) -> bool + Send + Sync,
{
    fn on_recv_timeout(&self, conn_id: ConnectionId, timeout: Duration, hint: &str) -> bool {
        self(conn_id, timeout, hint)
    }
}

/// Notified after every `send`, successful or not, with the size of the
/// attempted transfer.
pub trait DataSentHandler: Send + Sync {
    fn on_data_sent(&self, conn_id: ConnectionId, bytes: usize);
}

impl<F> DataSentHandler for F
where
    F: Fn(ConnectionId, usize) + Send + Sync,
{
    fn on_data_sent(&self, conn_id: ConnectionId, bytes: usize) {
        self(conn_id, bytes)
    }
}

/// Log levels for network events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for network events
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {
        // Do nothing
    }
}

/// Forwards messages to the `tracing` macros under the `mill_tcp` target.
#[derive(Default, Clone)]
pub struct TracingLogger {
    prefix: Option<String>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message is emitted as `"{prefix} - {message}"`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let prefix = self.prefix.as_deref().unwrap_or("");
        let sep = if prefix.is_empty() { "" } else { " - " };
        match level {
            LogLevel::Debug => tracing::debug!(target: "mill_tcp", "{prefix}{sep}{message}"),
            LogLevel::Info => tracing::info!(target: "mill_tcp", "{prefix}{sep}{message}"),
            LogLevel::Warn => tracing::warn!(target: "mill_tcp", "{prefix}{sep}{message}"),
            LogLevel::Error => tracing::error!(target: "mill_tcp", "{prefix}{sep}{message}"),
        }
    }
}

/// Wraps another logger and prepends a fixed prefix.
pub(crate) struct PrefixedLogger {
    inner: Arc<dyn Logger>,
    prefix: String,
}

impl PrefixedLogger {
    pub(crate) fn wrap(inner: Arc<dyn Logger>, prefix: Option<&str>) -> Arc<dyn Logger> {
        match prefix {
            Some(prefix) if !prefix.is_empty() => Arc::new(Self {
                inner,
                prefix: prefix.to_string(),
            }),
            _ => inner,
        }
    }
}

impl Logger for PrefixedLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.inner.log(level, &format!("{} - {}", self.prefix, message));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Collects messages so tests can assert on them.
    #[derive(Default)]
    pub struct CaptureLogger {
        pub lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl Logger for CaptureLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().push((level, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CaptureLogger;
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn#7");
        assert_eq!(ConnectionId(7).as_u64(), 7);
    }

    #[test]
    fn test_prefixed_logger() {
        let capture = Arc::new(CaptureLogger::default());
        let logger = PrefixedLogger::wrap(capture.clone(), Some("UbaServer"));
        logger.log(LogLevel::Info, "listening");

        let lines = capture.lines.lock();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (LogLevel::Info, "UbaServer - listening".to_string()));
    }

    #[test]
    fn test_empty_prefix_is_passthrough() {
        let capture = Arc::new(CaptureLogger::default());
        let logger = PrefixedLogger::wrap(capture.clone(), Some(""));
        logger.log(LogLevel::Warn, "plain");
        assert_eq!(capture.lines.lock()[0].1, "plain");
    }

    #[test]
    #[traced_test]
    fn test_tracing_logger_forwards() {
        TracingLogger::with_prefix("Backend").log(LogLevel::Info, "hello there");
        assert!(logs_contain("Backend - hello there"));
    }

    #[test]
    fn test_closure_handlers() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: Arc<dyn DataSentHandler> =
            Arc::new(move |id: ConnectionId, bytes: usize| seen_clone.lock().push((id, bytes)));
        handler.on_data_sent(ConnectionId(3), 104);
        assert_eq!(seen.lock().as_slice(), &[(ConnectionId(3), 104)]);
    }
}
