//! Error types for the TCP backend.
//!
//! Setup failures (resolve, bind, connect) and misuse of a connection handle
//! surface as [`NetworkError`]. Failures inside the receive loops never reach
//! the caller as errors: they end the connection and are reported through the
//! disconnect handler with a [`DisconnectReason`](crate::DisconnectReason).

use std::io;
use std::net::SocketAddr;
use std::result::Result as StdResult;
use std::time::Duration;

use crate::net::tcp::traits::ConnectionId;

pub type Result<T> = StdResult<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to resolve '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("bind {addr} failed because the address/port is already in use")]
    AddrInUse { addr: String },

    #[error("listen entries did not become ready within {0:?}")]
    ListenTimeout(Duration),

    #[error("no local addresses found to listen on")]
    NoListenAddresses,

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {host}:{port} timed out")]
    ConnectTimedOut { host: String, port: u16 },

    #[error("connection {0} was rejected by the connected callback")]
    Rejected(ConnectionId),

    #[error("header size {size} exceeds the maximum of {max} bytes")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is disconnected")]
    Disconnected(ConnectionId),

    #[error("send on connection {id} failed: {source}")]
    Send {
        id: ConnectionId,
        #[source]
        source: SendError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to spawn thread '{name}': {source}")]
    Thread {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Why a single `send` call failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("socket is no longer valid")]
    Disconnected,

    #[error("no progress after {0:?}")]
    TimedOut(Duration),

    #[error("completion reported {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}
