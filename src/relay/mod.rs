//! Relay layer - framed multiplexed tunnel core
//!
//! Provides:
//! - Frame encoding/decoding with payload compression and encryption
//! - Connection records with bounded frame queues
//! - I/O pumps, liveness watchdogs, per-record failure groups
//! - The acceptor-side and dialer-side multiplexers

mod acceptor;
mod channel;
mod dialer;
mod frame;
mod pump;
mod record;
mod watchdog;

pub use acceptor::Acceptor;
pub use channel::{
    drive_group, run_dispatch, spawn_main_channel, ChannelRole, FrameRouter, MainChannel,
};
pub use dialer::Dialer;
pub use frame::{ClientKind, Frame, FrameCodec, LENGTH_PREFIX_SIZE};
pub use record::{ConnQueues, ConnRecord, ConnRegistry};

use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;

/// Relay layer errors
///
/// Every variant is fatal to exactly one record; the supervisor converts the
/// first task error into cancellation of the record's sibling tasks.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame length {len} exceeds limit {max}")]
    Oversize { len: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("established timeout")]
    EstablishmentTimeout,

    #[error("ping pong timeout")]
    PingTimeout,

    #[error("conn timeout")]
    IdleTimeout,

    #[error("needclose")]
    ForcedClose,

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("queue closed")]
    QueueClosed,

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

impl From<crate::codec::CodecError> for RelayError {
    fn from(err: crate::codec::CodecError) -> Self {
        RelayError::Malformed(err.to_string())
    }
}

/// Generate a unique sub-connection id.
pub fn unique_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Monotonic nanoseconds since first use, for PING timestamps.
pub fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_is_unique() {
        let a = unique_id();
        let b = unique_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_monotonic_ns_advances() {
        let a = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_ns();
        assert!(b > a);
    }
}
