//! # muxtun
//!
//! A framed, multiplexed, bidirectional proxy tunnel.
//!
//! Two cooperating endpoints share one long-lived **main channel**: the
//! acceptor side terminates user connections on a listening socket, the
//! dialer side re-originates them toward a configured target. Every user
//! stream becomes a **sub-connection** relayed across the main channel as
//! length-prefixed frames, optionally compressed and encrypted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Endpoint binaries                    │
//! │           (muxtun-client, muxtun-server)             │
//! ├──────────────────────────────────────────────────────┤
//! │                Multiplexing layer                    │
//! │  (acceptor / dialer, frame routing, sub-conn pool)   │
//! ├──────────────────────────────────────────────────────┤
//! │                  Relay layer                         │
//! │    (framing, pumps, watchdogs, failure groups)       │
//! ├──────────────────────────────────────────────────────┤
//! │                 Transport layer                      │
//! │             (TCP, pluggable by proto)                │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod relay;
pub mod transport;

pub use config::TunnelConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),
}
