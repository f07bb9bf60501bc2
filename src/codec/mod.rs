//! Payload compression codec
//!
//! DATA payloads above the configured threshold are compressed with zstd.
//! The compressed form is only adopted when it is strictly shorter than the
//! input; callers keep the raw bytes otherwise.

use thiserror::Error;

/// Compression errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compress(std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

/// Compress a payload with zstd at the default level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::encode_all(data, zstd::DEFAULT_COMPRESSION_LEVEL).map_err(CodecError::Compress)
}

/// Decompress a zstd payload.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::decode_all(data).map_err(CodecError::Decompress)
}
