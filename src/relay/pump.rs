//! I/O pumps moving frames between streams and record queues
//!
//! The main channel runs framed pumps speaking the length-prefixed codec in
//! both directions. Sub-connections run raw pumps: reads from the user or
//! target stream are wrapped into DATA frames, and DATA frames from the
//! outbound queue are written back as raw payload bytes. A forwarder task
//! relays each sub-connection's inbound queue onto the main channel.

use super::{ConnRecord, Frame, FrameCodec, RelayError, LENGTH_PREFIX_SIZE};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

/// Field slack for the DATA tag, id, flag, and length prefixes.
const DATA_FRAME_OVERHEAD: usize = 64;

/// Largest raw read a sub-connection pump may wrap into one DATA frame so
/// the relayed frame always fits the main channel.
pub fn chunk_size(max_msg_size: usize) -> usize {
    max_msg_size.saturating_sub(DATA_FRAME_OVERHEAD).max(1)
}

/// Framed receive pump: wire frames onto the record's inbound queue.
pub async fn framed_recv<R>(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    mut stream: R,
    codec: FrameCodec,
    max_msg_size: usize,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = stream.read_exact(&mut len_buf) => {
                if let Err(err) = res {
                    error!(info = record.info(), %err, "framed recv: length read failed");
                    return Err(err.into());
                }
            }
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > max_msg_size {
            error!(info = record.info(), len, max_msg_size, "framed recv: oversize frame");
            return Err(RelayError::Oversize {
                len,
                max: max_msg_size,
            });
        }

        let mut body = vec![0u8; len];
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = stream.read_exact(&mut body) => {
                if let Err(err) = res {
                    error!(info = record.info(), %err, "framed recv: body read failed");
                    return Err(err.into());
                }
            }
        }

        let frame = match codec.decode(Bytes::from(body)) {
            Ok(frame) => frame,
            Err(err) => {
                error!(info = record.info(), %err, "framed recv: decode failed");
                return Err(err);
            }
        };
        trace!(info = record.info(), kind = frame.kind_name(), "framed recv");

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = record.inbound().send(frame) => {
                if res.is_err() {
                    return Err(RelayError::QueueClosed);
                }
            }
        }
    }
}

/// Framed send pump: outbound queue onto the wire, length prefix first.
pub async fn framed_send<W>(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut stream: W,
    codec: FrameCodec,
    max_msg_size: usize,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = stream.shutdown().await;
                return Ok(());
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => return Err(RelayError::QueueClosed),
            },
        };

        let body = match codec.encode(frame) {
            Ok(body) => body,
            Err(err) => {
                error!(info = record.info(), %err, "framed send: encode failed");
                return Err(err);
            }
        };

        if body.len() > max_msg_size {
            error!(
                info = record.info(),
                len = body.len(),
                max_msg_size,
                "framed send: oversize frame"
            );
            return Err(RelayError::Oversize {
                len: body.len(),
                max: max_msg_size,
            });
        }

        // Prefix and body must both land or the pump dies.
        let prefix = (body.len() as u32).to_le_bytes();
        if let Err(err) = stream.write_all(&prefix).await {
            error!(info = record.info(), %err, "framed send: prefix write failed");
            return Err(err.into());
        }
        if let Err(err) = stream.write_all(&body).await {
            error!(info = record.info(), %err, "framed send: body write failed");
            return Err(err.into());
        }
    }
}

/// Raw receive pump: wraps user-stream reads into DATA frames for the
/// record's inbound queue.
pub async fn raw_recv<R>(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    mut stream: R,
    max_msg_size: usize,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; chunk_size(max_msg_size)];
    loop {
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = stream.read(&mut buf) => match res {
                Ok(n) => n,
                Err(err) => {
                    error!(info = record.info(), %err, "raw recv: read failed");
                    return Err(err.into());
                }
            },
        };

        if n == 0 {
            trace!(info = record.info(), "raw recv: stream closed");
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed",
            )));
        }

        let frame = Frame::Data {
            id: record.id().to_string(),
            payload: Bytes::copy_from_slice(&buf[..n]),
            compressed: false,
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = record.inbound().send(frame) => {
                if res.is_err() {
                    return Err(RelayError::QueueClosed);
                }
            }
        }
    }
}

/// Raw send pump: DATA frames from the outbound queue become raw payload
/// writes on the user stream.
pub async fn raw_send<W>(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut stream: W,
    max_msg_size: usize,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = stream.shutdown().await;
                return Ok(());
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => return Err(RelayError::QueueClosed),
            },
        };

        let len = frame.body_len();
        if len > max_msg_size {
            error!(info = record.info(), len, max_msg_size, "raw send: oversize frame");
            return Err(RelayError::Oversize {
                len,
                max: max_msg_size,
            });
        }

        match frame {
            Frame::Data { payload, .. } => {
                if let Err(err) = stream.write_all(&payload).await {
                    error!(info = record.info(), %err, "raw send: write failed");
                    return Err(err.into());
                }
            }
            other => {
                warn!(
                    info = record.info(),
                    kind = other.kind_name(),
                    "raw send: dropping non-DATA frame"
                );
            }
        }
    }
}

/// Forwarder: relays a sub-connection's inbound queue onto the main
/// channel's outbound queue, counting moved frames as activity.
pub async fn forward_to_main(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    mut inbound_rx: mpsc::Receiver<Frame>,
    main_outbound: mpsc::Sender<Frame>,
) -> Result<(), RelayError> {
    // Nothing leaves for the peer until its twin record exists; frames read
    // before the OPEN verdict wait in the bounded inbound queue.
    tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        _ = record.established() => {}
    }

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            frame = inbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => return Err(RelayError::QueueClosed),
            },
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = main_outbound.send(frame) => {
                if res.is_err() {
                    return Err(RelayError::QueueClosed);
                }
            }
        }

        record.touch_activity();
    }
}
