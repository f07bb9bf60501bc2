//! Frame encoding/decoding for the tunnel protocol
//!
//! On the wire every frame is a little-endian u32 length prefix followed by
//! the frame body:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |        length (u32, LE)           |
//! +--------+--------+--------+--------+
//! |  tag   |      variant fields      |
//! +--------+--------------------------+
//! ```
//!
//! Body fields are big-endian; strings carry a u16 length prefix, DATA
//! payloads a u32 length prefix. DATA payloads are compressed (when the
//! threshold is met and the result is strictly shorter) and then encrypted;
//! decoding reverses the order. Control frames are never transformed.

use super::RelayError;
use crate::codec;
use crate::crypto::Cipher;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the wire length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Kind of endpoint announced in the login frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientKind {
    /// Forward proxy: acceptor runs at the client
    Proxy = 0x00,
    /// Reverse proxy: acceptor runs at the server
    ReverseProxy = 0x01,
}

impl TryFrom<u8> for ClientKind {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ClientKind::Proxy),
            0x01 => Ok(ClientKind::ReverseProxy),
            _ => Err(RelayError::Malformed(format!(
                "unknown client kind: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Main-channel login carrying the shared key
    Login { kind: ClientKind, key: String },
    /// Login verdict from the peer
    LoginRsp { accepted: bool, message: String },
    /// Liveness probe, stamped with sender-local monotonic nanoseconds
    Ping { time: u64 },
    /// Liveness answer echoing the probe timestamp verbatim
    Pong { time: u64 },
    /// Request to open a sub-connection
    Open { id: String },
    /// Open verdict from the dialer side
    OpenRsp {
        id: String,
        accepted: bool,
        message: String,
    },
    /// Relayed payload bytes for one sub-connection
    Data {
        id: String,
        payload: Bytes,
        compressed: bool,
    },
    /// Request to tear down a sub-connection
    Close { id: String, message: String },
}

const TAG_LOGIN: u8 = 0x00;
const TAG_LOGIN_RSP: u8 = 0x01;
const TAG_PING: u8 = 0x02;
const TAG_PONG: u8 = 0x03;
const TAG_OPEN: u8 = 0x04;
const TAG_OPEN_RSP: u8 = 0x05;
const TAG_DATA: u8 = 0x06;
const TAG_CLOSE: u8 = 0x07;

impl Frame {
    /// Frame kind name for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Login { .. } => "LOGIN",
            Frame::LoginRsp { .. } => "LOGIN_RSP",
            Frame::Ping { .. } => "PING",
            Frame::Pong { .. } => "PONG",
            Frame::Open { .. } => "OPEN",
            Frame::OpenRsp { .. } => "OPEN_RSP",
            Frame::Data { .. } => "DATA",
            Frame::Close { .. } => "CLOSE",
        }
    }

    /// Serialized body length of the frame as carried, before any payload
    /// transformation.
    pub fn body_len(&self) -> usize {
        match self {
            Frame::Login { key, .. } => 1 + 1 + 2 + key.len(),
            Frame::LoginRsp { message, .. } => 1 + 1 + 2 + message.len(),
            Frame::Ping { .. } | Frame::Pong { .. } => 1 + 8,
            Frame::Open { id } => 1 + 2 + id.len(),
            Frame::OpenRsp { id, message, .. } => 1 + 2 + id.len() + 1 + 2 + message.len(),
            Frame::Data { id, payload, .. } => 1 + 2 + id.len() + 1 + 4 + payload.len(),
            Frame::Close { id, message } => 1 + 2 + id.len() + 2 + message.len(),
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), RelayError> {
    if s.len() > u16::MAX as usize {
        return Err(RelayError::Malformed(format!(
            "string field too long: {}",
            s.len()
        )));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<String, RelayError> {
    if buf.remaining() < 2 {
        return Err(RelayError::Malformed("truncated string length".to_string()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(RelayError::Malformed("truncated string".to_string()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| RelayError::Malformed("invalid utf-8".to_string()))
}

fn get_bool(buf: &mut Bytes) -> Result<bool, RelayError> {
    if buf.remaining() < 1 {
        return Err(RelayError::Malformed("truncated bool".to_string()));
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RelayError::Malformed(format!("invalid bool: {}", other))),
    }
}

fn get_u64(buf: &mut Bytes) -> Result<u64, RelayError> {
    if buf.remaining() < 8 {
        return Err(RelayError::Malformed("truncated u64".to_string()));
    }
    Ok(buf.get_u64())
}

/// Encoder/decoder applying the configured payload transformations.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compress_threshold: usize,
    cipher: Option<Cipher>,
}

impl FrameCodec {
    /// Build a codec from the configured compression threshold and cipher
    /// secret. A zero threshold disables compression, an empty secret
    /// disables encryption.
    pub fn new(compress_threshold: usize, encrypt_secret: &str) -> Self {
        Self {
            compress_threshold,
            cipher: Cipher::new(encrypt_secret),
        }
    }

    /// Serialize a frame to its wire body, compressing and encrypting DATA
    /// payloads as configured.
    pub fn encode(&self, frame: Frame) -> Result<Bytes, RelayError> {
        let frame = match frame {
            Frame::Data {
                id,
                payload,
                compressed,
            } => {
                let (payload, compressed) = self.transform_out(payload, compressed)?;
                Frame::Data {
                    id,
                    payload,
                    compressed,
                }
            }
            other => other,
        };

        let mut buf = BytesMut::with_capacity(frame.body_len());
        match &frame {
            Frame::Login { kind, key } => {
                buf.put_u8(TAG_LOGIN);
                buf.put_u8(*kind as u8);
                put_string(&mut buf, key)?;
            }
            Frame::LoginRsp { accepted, message } => {
                buf.put_u8(TAG_LOGIN_RSP);
                buf.put_u8(*accepted as u8);
                put_string(&mut buf, message)?;
            }
            Frame::Ping { time } => {
                buf.put_u8(TAG_PING);
                buf.put_u64(*time);
            }
            Frame::Pong { time } => {
                buf.put_u8(TAG_PONG);
                buf.put_u64(*time);
            }
            Frame::Open { id } => {
                buf.put_u8(TAG_OPEN);
                put_string(&mut buf, id)?;
            }
            Frame::OpenRsp {
                id,
                accepted,
                message,
            } => {
                buf.put_u8(TAG_OPEN_RSP);
                put_string(&mut buf, id)?;
                buf.put_u8(*accepted as u8);
                put_string(&mut buf, message)?;
            }
            Frame::Data {
                id,
                payload,
                compressed,
            } => {
                buf.put_u8(TAG_DATA);
                put_string(&mut buf, id)?;
                buf.put_u8(*compressed as u8);
                if payload.len() > u32::MAX as usize {
                    return Err(RelayError::Malformed("payload too long".to_string()));
                }
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Frame::Close { id, message } => {
                buf.put_u8(TAG_CLOSE);
                put_string(&mut buf, id)?;
                put_string(&mut buf, message)?;
            }
        }

        Ok(buf.freeze())
    }

    /// Parse a wire body back into a frame, decrypting and decompressing
    /// DATA payloads.
    pub fn decode(&self, body: Bytes) -> Result<Frame, RelayError> {
        let mut buf = body;
        if buf.remaining() < 1 {
            return Err(RelayError::Malformed("empty frame".to_string()));
        }

        let tag = buf.get_u8();
        let frame = match tag {
            TAG_LOGIN => {
                if buf.remaining() < 1 {
                    return Err(RelayError::Malformed("truncated login".to_string()));
                }
                let kind = ClientKind::try_from(buf.get_u8())?;
                let key = get_string(&mut buf)?;
                Frame::Login { kind, key }
            }
            TAG_LOGIN_RSP => {
                let accepted = get_bool(&mut buf)?;
                let message = get_string(&mut buf)?;
                Frame::LoginRsp { accepted, message }
            }
            TAG_PING => Frame::Ping {
                time: get_u64(&mut buf)?,
            },
            TAG_PONG => Frame::Pong {
                time: get_u64(&mut buf)?,
            },
            TAG_OPEN => Frame::Open {
                id: get_string(&mut buf)?,
            },
            TAG_OPEN_RSP => {
                let id = get_string(&mut buf)?;
                let accepted = get_bool(&mut buf)?;
                let message = get_string(&mut buf)?;
                Frame::OpenRsp {
                    id,
                    accepted,
                    message,
                }
            }
            TAG_DATA => {
                let id = get_string(&mut buf)?;
                let compressed = get_bool(&mut buf)?;
                if buf.remaining() < 4 {
                    return Err(RelayError::Malformed("truncated payload length".to_string()));
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(RelayError::Malformed("truncated payload".to_string()));
                }
                let payload = buf.split_to(len);
                let payload = self.transform_in(payload, compressed)?;
                Frame::Data {
                    id,
                    payload,
                    compressed: false,
                }
            }
            TAG_CLOSE => {
                let id = get_string(&mut buf)?;
                let message = get_string(&mut buf)?;
                Frame::Close { id, message }
            }
            other => {
                return Err(RelayError::Malformed(format!("unknown frame tag: {}", other)));
            }
        };

        if buf.has_remaining() {
            return Err(RelayError::Malformed(format!(
                "{} trailing bytes after frame",
                buf.remaining()
            )));
        }

        Ok(frame)
    }

    /// Outbound DATA payload path: compress when worthwhile, then encrypt.
    fn transform_out(
        &self,
        payload: Bytes,
        compressed: bool,
    ) -> Result<(Bytes, bool), RelayError> {
        let (mut data, compressed) =
            if !compressed && self.compress_threshold > 0 && payload.len() > self.compress_threshold
            {
                let packed = codec::compress(&payload)?;
                if packed.len() < payload.len() {
                    (packed, true)
                } else {
                    (payload.to_vec(), false)
                }
            } else {
                (payload.to_vec(), compressed)
            };

        if let Some(cipher) = &self.cipher {
            cipher.apply(&mut data);
        }

        Ok((Bytes::from(data), compressed))
    }

    /// Inbound DATA payload path: decrypt, then decompress when flagged.
    fn transform_in(&self, payload: Bytes, compressed: bool) -> Result<Bytes, RelayError> {
        let mut data = payload.to_vec();

        if let Some(cipher) = &self.cipher {
            cipher.apply(&mut data);
        }

        if compressed {
            data = codec::decompress(&data)?;
        }

        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> FrameCodec {
        FrameCodec::new(0, "")
    }

    fn all_frames() -> Vec<Frame> {
        vec![
            Frame::Login {
                kind: ClientKind::Proxy,
                key: "shared".to_string(),
            },
            Frame::LoginRsp {
                accepted: true,
                message: String::new(),
            },
            Frame::Ping { time: 123456789 },
            Frame::Pong { time: 123456789 },
            Frame::Open {
                id: "abc".to_string(),
            },
            Frame::OpenRsp {
                id: "abc".to_string(),
                accepted: false,
                message: "Dial fail".to_string(),
            },
            Frame::Data {
                id: "abc".to_string(),
                payload: Bytes::from_static(b"hello"),
                compressed: false,
            },
            Frame::Close {
                id: "abc".to_string(),
                message: "needclose".to_string(),
            },
        ]
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let codec = plain();
        for frame in all_frames() {
            let body = codec.encode(frame.clone()).unwrap();
            let decoded = codec.decode(body).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_roundtrip_compressed_and_encrypted() {
        for (threshold, secret) in [(0, ""), (10, ""), (0, "k"), (10, "k")] {
            let codec = FrameCodec::new(threshold, secret);
            let frame = Frame::Data {
                id: "abc".to_string(),
                payload: Bytes::from(vec![0u8; 64]),
                compressed: false,
            };
            let body = codec.encode(frame.clone()).unwrap();
            let decoded = codec.decode(body).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        for (threshold, secret) in [(0, ""), (10, "k")] {
            let codec = FrameCodec::new(threshold, secret);
            let frame = Frame::Data {
                id: "x".to_string(),
                payload: Bytes::new(),
                compressed: false,
            };
            let decoded = codec.decode(codec.encode(frame.clone()).unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_compress_only_when_strictly_shorter() {
        let codec = FrameCodec::new(10, "");

        // 64 zero bytes shrink under zstd.
        let body = codec
            .encode(Frame::Data {
                id: "a".to_string(),
                payload: Bytes::from(vec![0u8; 64]),
                compressed: false,
            })
            .unwrap();
        // tag + id + flag byte: flag sits right after the id string.
        assert_eq!(body[1 + 2 + 1], 1, "zero payload should compress");

        // 64 bytes cycling through all values do not shrink.
        let noise: Vec<u8> = (0..64u32).map(|i| (i * 197 + 13) as u8).collect();
        let raw = noise.clone();
        let body = codec
            .encode(Frame::Data {
                id: "a".to_string(),
                payload: Bytes::from(noise),
                compressed: false,
            })
            .unwrap();
        assert_eq!(body[1 + 2 + 1], 0, "incompressible payload stays raw");
        // Raw bytes travel untouched on the wire.
        assert_eq!(&body[body.len() - raw.len()..], &raw[..]);
    }

    #[test]
    fn test_below_threshold_stays_raw() {
        let codec = FrameCodec::new(10, "");
        let body = codec
            .encode(Frame::Data {
                id: "a".to_string(),
                payload: Bytes::from(vec![0u8; 10]),
                compressed: false,
            })
            .unwrap();
        assert_eq!(body[1 + 2 + 1], 0);
    }

    #[test]
    fn test_encrypted_payload_differs_on_wire() {
        let frame = Frame::Data {
            id: "a".to_string(),
            payload: Bytes::from_static(b"hello"),
            compressed: false,
        };
        let open = plain().encode(frame.clone()).unwrap();
        let sealed = FrameCodec::new(0, "k").encode(frame).unwrap();
        assert_ne!(open, sealed);
        assert_eq!(open.len(), sealed.len());
    }

    #[test]
    fn test_control_frames_not_encrypted() {
        let frame = Frame::Open {
            id: "abc".to_string(),
        };
        let open = plain().encode(frame.clone()).unwrap();
        let sealed = FrameCodec::new(0, "k").encode(frame).unwrap();
        assert_eq!(open, sealed);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let err = plain().decode(Bytes::from_static(&[0xff])).unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let codec = plain();
        let body = codec
            .encode(Frame::Open {
                id: "abcdef".to_string(),
            })
            .unwrap();
        let err = codec.decode(body.slice(..body.len() - 2)).unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let codec = plain();
        let mut body = codec.encode(Frame::Ping { time: 7 }).unwrap().to_vec();
        body.push(0);
        let err = codec.decode(Bytes::from(body)).unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(plain().decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_body_len_matches_encoding() {
        let codec = plain();
        for frame in all_frames() {
            let expected = frame.body_len();
            let body = codec.encode(frame).unwrap();
            assert_eq!(body.len(), expected);
        }
    }
}
