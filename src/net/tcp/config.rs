use std::sync::Arc;

use serde::Deserialize;

use crate::error::{NetworkError, Result};
use crate::net::tcp::traits::{Logger, TracingLogger};

/// Configuration for the TCP backend.
///
/// Use `TcpBackendConfig::builder()` for ergonomic construction, or
/// [`apply_toml`](TcpBackendConfig::apply_toml) to overlay values from a
/// configuration file.
///
/// ## Socket Options
///
/// - disable_nagle: When enabled (default), sets TCP_NODELAY on every connection
///
/// ## Threading
///
/// - reactor_workers: 0 (default) gives every connection its own receive
///   thread. Any other value routes all receives through one shared readiness
///   reactor served by that many worker threads.
/// - use_overlapped_send: hand each send to a per-connection writer thread and
///   wait for its completion instead of writing on the caller's thread.
/// - status_update_seconds: when non-zero, a statistics thread logs transfer
///   counters at this interval
#[derive(Clone)]
pub struct TcpBackendConfig {
    /// Set TCP_NODELAY on accepted and connected sockets
    pub disable_nagle: bool,
    /// Interval of the statistics thread, 0 disables it
    pub status_update_seconds: u32,
    /// Completion-based sends through a writer thread
    pub use_overlapped_send: bool,
    /// Worker threads of the shared receive reactor, 0 for thread-per-connection
    pub reactor_workers: u16,
    /// Logger for network events
    pub logger: Arc<dyn Logger>,
    /// Prepended to every log message
    pub log_prefix: Option<String>,
}

impl TcpBackendConfig {
    /// Create a new builder for TcpBackendConfig
    pub fn builder() -> TcpBackendConfigBuilder {
        TcpBackendConfigBuilder::new()
    }

    /// Overlay values from the TOML table named `table`.
    ///
    /// Recognised keys are `DisableNagle`, `StatusUpdateSeconds`,
    /// `UseOverlappedSend` and `IocpWorkerCount`. A missing table leaves the
    /// configuration untouched.
    pub fn apply_toml(&mut self, text: &str, table: &str) -> Result<()> {
        let root: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| NetworkError::Config(e.to_string()))?;

        let Some(value) = root.get(table) else {
            return Ok(());
        };

        let values: TomlTable = value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| NetworkError::Config(format!("[{table}] {e}")))?;

        if let Some(v) = values.disable_nagle {
            self.disable_nagle = v;
        }
        if let Some(v) = values.status_update_seconds {
            self.status_update_seconds = v;
        }
        if let Some(v) = values.use_overlapped_send {
            self.use_overlapped_send = v;
        }
        if let Some(v) = values.iocp_worker_count {
            self.reactor_workers = v;
        }
        Ok(())
    }
}

impl Default for TcpBackendConfig {
    fn default() -> Self {
        Self {
            disable_nagle: true,
            status_update_seconds: 0,
            use_overlapped_send: false,
            reactor_workers: 0,
            logger: Arc::new(TracingLogger::new()),
            log_prefix: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct TomlTable {
    disable_nagle: Option<bool>,
    status_update_seconds: Option<u32>,
    use_overlapped_send: Option<bool>,
    iocp_worker_count: Option<u16>,
}

/// Builder for TcpBackendConfig using the builder pattern.
///
/// All fields are optional and will use defaults from TcpBackendConfig::default()
/// if not explicitly set.
pub struct TcpBackendConfigBuilder {
    disable_nagle: Option<bool>,
    status_update_seconds: Option<u32>,
    use_overlapped_send: Option<bool>,
    reactor_workers: Option<u16>,
    logger: Option<Arc<dyn Logger>>,
    log_prefix: Option<String>,
}

impl TcpBackendConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            disable_nagle: None,
            status_update_seconds: None,
            use_overlapped_send: None,
            reactor_workers: None,
            logger: None,
            log_prefix: None,
        }
    }

    /// Enable or disable TCP_NODELAY
    pub fn disable_nagle(mut self, enabled: bool) -> Self {
        self.disable_nagle = Some(enabled);
        self
    }

    /// Log transfer statistics every `seconds`, 0 to disable
    pub fn status_update_seconds(mut self, seconds: u32) -> Self {
        self.status_update_seconds = Some(seconds);
        self
    }

    /// Send through a per-connection writer thread
    pub fn use_overlapped_send(mut self, enabled: bool) -> Self {
        self.use_overlapped_send = Some(enabled);
        self
    }

    /// Receive through a shared reactor with this many workers
    pub fn reactor_workers(mut self, workers: u16) -> Self {
        self.reactor_workers = Some(workers);
        self
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Prefix every log line
    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = Some(prefix.into());
        self
    }

    /// Build the TcpBackendConfig
    pub fn build(self) -> TcpBackendConfig {
        let default = TcpBackendConfig::default();
        TcpBackendConfig {
            disable_nagle: self.disable_nagle.unwrap_or(default.disable_nagle),
            status_update_seconds: self
                .status_update_seconds
                .unwrap_or(default.status_update_seconds),
            use_overlapped_send: self
                .use_overlapped_send
                .unwrap_or(default.use_overlapped_send),
            reactor_workers: self.reactor_workers.unwrap_or(default.reactor_workers),
            logger: self.logger.unwrap_or(default.logger),
            log_prefix: self.log_prefix.or(default.log_prefix),
        }
    }
}

impl Default for TcpBackendConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = TcpBackendConfig::builder().build();
        assert!(config.disable_nagle);
        assert_eq!(config.status_update_seconds, 0);
        assert!(!config.use_overlapped_send);
        assert_eq!(config.reactor_workers, 0);
        assert!(config.log_prefix.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = TcpBackendConfig::builder()
            .disable_nagle(false)
            .status_update_seconds(5)
            .use_overlapped_send(true)
            .reactor_workers(3)
            .log_prefix("Client")
            .build();
        assert!(!config.disable_nagle);
        assert_eq!(config.status_update_seconds, 5);
        assert!(config.use_overlapped_send);
        assert_eq!(config.reactor_workers, 3);
        assert_eq!(config.log_prefix.as_deref(), Some("Client"));
    }

    #[test]
    fn test_apply_toml_table() {
        let mut config = TcpBackendConfig::default();
        let text = r#"
            [Storage]
            CasCapacityBytes = 10

            [TcpBackend]
            DisableNagle = false
            StatusUpdateSeconds = 30
            UseOverlappedSend = true
            IocpWorkerCount = 4
        "#;
        config.apply_toml(text, "TcpBackend").unwrap();
        assert!(!config.disable_nagle);
        assert_eq!(config.status_update_seconds, 30);
        assert!(config.use_overlapped_send);
        assert_eq!(config.reactor_workers, 4);
    }

    #[test]
    fn test_apply_toml_missing_table_is_noop() {
        let mut config = TcpBackendConfig::default();
        config.apply_toml("[Other]\nX = 1\n", "TcpBackend").unwrap();
        assert!(config.disable_nagle);
        assert_eq!(config.reactor_workers, 0);
    }

    #[test]
    fn test_apply_toml_errors() {
        let mut config = TcpBackendConfig::default();
        assert!(matches!(
            config.apply_toml("[TcpBackend\n", "TcpBackend"),
            Err(NetworkError::Config(_))
        ));
        assert!(matches!(
            config.apply_toml("[TcpBackend]\nDisableNagle = \"yes\"\n", "TcpBackend"),
            Err(NetworkError::Config(_))
        ));
        assert!(matches!(
            config.apply_toml("[TcpBackend]\nUnknownKey = 1\n", "TcpBackend"),
            Err(NetworkError::Config(_))
        ));
    }
}
