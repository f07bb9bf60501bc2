//! Transport layer implementations
//!
//! Provides pluggable stream carriers selected by the configured `proto`
//! string. TCP is the default; other carriers implement the same traits.

mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("unknown proto: {0}")]
    UnknownProto(String),

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,
}

/// A bidirectional byte stream produced by a transport.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Human-readable peer description for logging.
    fn info(&self) -> String;
}

/// Boxed stream handed to the relay layer.
pub type BoxedStream = Box<dyn Stream>;

/// A listening endpoint accepting inbound streams.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<BoxedStream, TransportError>;

    /// Local address description for logging.
    fn info(&self) -> String;
}

/// Trait for transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a listening endpoint on `addr`.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError>;

    /// Dial `addr`, waiting at most `connect_timeout` seconds.
    async fn dial(&self, addr: &str, connect_timeout: u64) -> Result<BoxedStream, TransportError>;
}

/// Look up the transport for a `proto` selector string.
pub fn transport_for(proto: &str) -> Result<Arc<dyn Transport>, TransportError> {
    match proto {
        "tcp" => Ok(Arc::new(TcpTransport::new())),
        other => Err(TransportError::UnknownProto(other.to_string())),
    }
}
