//! # Meshbridge
//!
//! A multi-cluster service-network bridge. Each broker node owns one virtual
//! L3 interface and cooperates with its peers to form a mesh over
//! TLS-secured TCP tunnels, so that workloads in one cluster can reach
//! service IPs owned by another cluster as if they were local.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Declarative Store                    │
//! │         (link specs, reconciliation events)          │
//! ├─────────────────────────────────────────────────────┤
//! │                Connect Reconciler                    │
//! │      (one task per served link, retry backoff)       │
//! ├─────────────────────────────────────────────────────┤
//! │                       Mux                            │
//! │    (tun ownership, peer table, listener, routing)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Tunnel Connections                   │
//! │      (hello handshake, framing, ingress policy)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │         (TCP, mutually-authenticated TLS)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod links;
pub mod mux;
pub mod net;
pub mod protocol;
pub mod reconcile;
pub mod router;
pub mod store;
pub mod transport;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum payload carried by a single wire frame (u16 length prefix)
pub const MAX_FRAME_SIZE: usize = 65535;

/// Receive buffer size, the effective mesh MTU guard
pub const BUFFER_SIZE: usize = 17000;

/// Default broker port
pub const DEFAULT_PORT: u16 = 8088;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Link error: {0}")]
    Link(#[from] links::LinkError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] mux::TunnelError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Shutting down")]
    Shutdown,
}
