// Copyright (c) 2026 bepd
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Frame codec: the 8-byte header every message travels under, optional LZ4
//! compression above a size threshold, and encode/decode of a full frame.

use thiserror::Error;

use super::message::{Message, MessageKind};
use super::xdr::XdrError;

/// Protocol version carried in the header's top 4 bits. Only version 0 is
/// understood; anything else is rejected rather than guessed at.
pub const VERSION: u8 = 0;

/// Frames whose uncompressed body is at least this many bytes are eligible
/// for LZ4 compression under [`CompressionPolicy::Default`].
pub const COMPRESSION_THRESHOLD: usize = 128;

/// `msg_id` wraps at this value (12 bits on the wire).
pub const MSG_ID_MODULUS: u32 = 0x1000;

const HEADER_LEN: usize = 8;

/// Errors decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than 8 bytes were available for the header.
    #[error("frame header truncated")]
    TruncatedHeader,
    /// The header names a protocol version this crate does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    /// The body did not arrive in full.
    #[error("frame body truncated")]
    TruncatedBody,
    /// The frame claimed a `msg_type` this crate does not know.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    /// LZ4 decompression of a compressed body failed.
    #[error("lz4 decompression failed: {0}")]
    Decompress(String),
    /// The (possibly decompressed) body did not parse as its declared type.
    #[error("malformed message body: {0}")]
    Xdr(#[from] XdrError),
}

/// Decoded frame header, prior to body decode.
///
/// Bit positions below follow the wire spec's own numbering, where bit 0 is
/// the word's least-significant bit (not RFC-diagram MSB-first numbering).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version (bits 28..31, the word's top 4 bits).
    pub version: u8,
    /// Correlation id (bits 16..27, 12 bits, wraps at 4096).
    pub msg_id: u16,
    /// Message kind raw byte (bits 8..15).
    pub msg_type: u8,
    /// Whether the body is LZ4-compressed (bit 0, the word's LSB).
    pub compressed: bool,
    /// Length in bytes of the body that follows the header.
    pub length: u32,
}

// Bit parsing only: a header with an unsupported version or unknown
// msg_type still decodes cleanly so the caller can learn its `length` (and
// thus how many bytes to skip) before deciding whether to drop the frame.
// Validity is `validate_header`'s job, not this function's.
fn decode_header(bytes: &[u8; HEADER_LEN]) -> FrameHeader {
    let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let version = (word >> 28) as u8;
    let msg_id = ((word >> 16) & 0x0fff) as u16;
    let msg_type = ((word >> 8) & 0xff) as u8;
    let compressed = word & 0x1 != 0;

    FrameHeader {
        version,
        msg_id,
        msg_type,
        compressed,
        length,
    }
}

/// Check a header's version and message kind, the two fields that make a
/// frame forward-compat-skippable rather than an outright decode error.
fn validate_header(header: &FrameHeader) -> Result<MessageKind, FrameError> {
    if header.version != VERSION {
        return Err(FrameError::UnsupportedVersion(header.version));
    }
    MessageKind::from_u8(header.msg_type).ok_or(FrameError::UnknownMessageType(header.msg_type))
}

fn encode_header(msg_id: u16, msg_type: u8, compressed: bool, length: u32) -> [u8; HEADER_LEN] {
    let mut word = (VERSION as u32) << 28;
    word |= (u32::from(msg_id) & 0x0fff) << 16;
    word |= u32::from(msg_type) << 8;
    word |= compressed as u32;

    let mut out = [0u8; HEADER_LEN];
    out[..4].copy_from_slice(&word.to_be_bytes());
    out[4..].copy_from_slice(&length.to_be_bytes());
    out
}

/// When to LZ4-compress an outgoing frame's body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPolicy {
    /// Always compress, regardless of body size.
    Always,
    /// Never compress.
    Never,
    /// Compress bodies of at least [`COMPRESSION_THRESHOLD`] bytes.
    Default,
}

impl CompressionPolicy {
    /// `Default` compresses everything except `RESPONSE`: a response carries
    /// bulk file data whose entropy is already high, so compressing it would
    /// just burn CPU for no size win.
    fn should_compress(self, kind: MessageKind, body_len: usize) -> bool {
        match self {
            CompressionPolicy::Always => true,
            CompressionPolicy::Never => false,
            CompressionPolicy::Default => {
                kind != MessageKind::Response && body_len >= COMPRESSION_THRESHOLD
            }
        }
    }
}

/// Encode `message` into a full frame (header + body), applying `policy`.
pub fn encode_frame(message: &Message, policy: CompressionPolicy) -> Vec<u8> {
    let body = message.pack_body();
    let compress = policy.should_compress(message.kind(), body.len());

    let wire_body = if compress {
        let mut prefixed = Vec::with_capacity(4 + lz4_flex::block::get_maximum_output_size(body.len()));
        prefixed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        prefixed.extend(lz4_flex::block::compress(&body));
        prefixed
    } else {
        body
    };

    let header = encode_header(
        message.msg_id(),
        message.kind() as u8,
        compress,
        wire_body.len() as u32,
    );

    let mut frame = Vec::with_capacity(HEADER_LEN + wire_body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&wire_body);
    frame
}

/// Decode a complete frame (header + body) already assembled in memory.
///
/// An unsupported version or unknown message type is still an `Err` here
/// (this function commits to producing a `Message` or failing) — it is the
/// caller's job, e.g. a connection's read loop via [`peek_header`], to treat
/// those two specific errors as "skip this frame and keep reading" rather
/// than a fatal transport error.
pub fn decode_frame(frame: &[u8]) -> Result<Message, FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::TruncatedHeader);
    }
    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&frame[..HEADER_LEN]);
    let header = decode_header(&header_bytes);
    let kind = validate_header(&header)?;

    let wire_body = frame
        .get(HEADER_LEN..HEADER_LEN + header.length as usize)
        .ok_or(FrameError::TruncatedBody)?;

    let body = if header.compressed {
        decompress_body(wire_body)?
    } else {
        wire_body.to_vec()
    };

    Ok(Message::unpack_body(kind, header.msg_id, &body)?)
}

fn decompress_body(wire_body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if wire_body.len() < 4 {
        return Err(FrameError::Decompress("compressed body missing length prefix".into()));
    }
    let uncompressed_len =
        u32::from_be_bytes([wire_body[0], wire_body[1], wire_body[2], wire_body[3]]) as usize;
    lz4_flex::block::decompress(&wire_body[4..], uncompressed_len)
        .map_err(|e| FrameError::Decompress(e.to_string()))
}

/// Peek a frame header out of a buffer without consuming it, returning the
/// header and the total frame length (header + body) if enough bytes have
/// arrived. Used by the connection's read loop to know how much more to
/// buffer before calling [`decode_frame`].
pub fn peek_header(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
    let header = decode_header(&header_bytes);
    let total = HEADER_LEN + header.length as usize;
    Ok(Some((header, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Close, ResponseCode};

    #[test]
    fn header_round_trips() {
        let header = encode_header(0xabc, 3, true, 42);
        let decoded = decode_header(&header);
        assert_eq!(decoded.msg_id, 0xabc);
        assert_eq!(decoded.msg_type, 3);
        assert!(decoded.compressed);
        assert_eq!(decoded.length, 42);
    }

    #[test]
    fn msg_id_masks_to_twelve_bits() {
        let header = encode_header(0x1fff, 0, false, 0);
        let decoded = decode_header(&header);
        assert_eq!(decoded.msg_id, 0x0fff);
    }

    #[test]
    fn ping_round_trips_uncompressed() {
        let msg = Message::Ping(7);
        let frame = encode_frame(&msg, CompressionPolicy::Never);
        assert_eq!(frame.len(), HEADER_LEN);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn large_close_round_trips_compressed() {
        let reason = "x".repeat(512);
        let msg = Message::Close(
            9,
            Close {
                reason,
                code: ResponseCode::Error,
            },
        );
        let frame = encode_frame(&msg, CompressionPolicy::Default);
        let header = decode_header(&frame[..HEADER_LEN].try_into().unwrap());
        assert!(header.compressed);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut frame = encode_frame(&Message::Ping(1), CompressionPolicy::Never);
        frame[0] |= 0xf0;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn peek_header_reports_total_frame_length() {
        let frame = encode_frame(&Message::Ping(1), CompressionPolicy::Never);
        let (_, total) = peek_header(&frame).unwrap().unwrap();
        assert_eq!(total, frame.len());
        assert_eq!(peek_header(&frame[..4]).unwrap(), None);
    }
}
