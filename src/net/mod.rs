//! Networking for Mill-TCP.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     User Application                     │
//! │  on_connected / FrameHandler / on_disconnect callbacks   │
//! └────────────┬──────────────────────▲──────────────────────┘
//!              │ connect, listen,     │ callbacks
//!              │ send                 │
//!              ▼                      │
//! ┌──────────────────────────────────────────────────────────┐
//! │                    tcp::TcpBackend                       │
//! │  ┌───────────┐   ┌─────────────┐   ┌──────────────────┐  │
//! │  │ listeners │──▶│ connections │──▶│ recv threads or  │  │
//! │  │           │   │             │   │ reactor workers  │  │
//! │  └───────────┘   └─────────────┘   └──────────────────┘  │
//! └────────────┬─────────────────────────────────────────────┘
//!              │ socket2 / mio
//!              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │           Operating System (epoll/kqueue/IOCP)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! [`socket`] holds the socket option helpers shared by the accept and
//! connect paths, [`addr`] the interface enumeration and name resolution.

pub mod addr;
pub mod socket;
pub mod tcp;
