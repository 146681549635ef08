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

//! Minimal XDR primitive packer/unpacker: the subset BEP message bodies use
//! (u32, u64-as-two-u32, length-prefixed strings/opaque padded to 4 bytes,
//! and u32-counted arrays). Not a general-purpose RFC 4506 implementation.

use thiserror::Error;

/// Errors decoding an XDR-encoded message body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XdrError {
    /// Ran out of bytes mid-decode.
    #[error("unexpected end of buffer")]
    Eof,
    /// A declared length could not fit in `usize` or exceeded the buffer.
    #[error("invalid length")]
    InvalidLength,
    /// Decoded bytes are not valid UTF-8 where a string was expected.
    #[error("invalid utf-8 string")]
    InvalidUtf8,
}

fn padded_len(n: usize) -> usize {
    (n + 3) & !3
}

/// Append-only XDR packer.
#[derive(Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    /// New, empty packer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the packer, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Pack a plain u32.
    pub fn pack_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Pack a u64 as two big-endian u32s (high, low).
    pub fn pack_u64(&mut self, v: u64) {
        self.pack_u32((v >> 32) as u32);
        self.pack_u32(v as u32);
    }

    /// Pack length-prefixed opaque bytes, zero-padded to a 4-byte boundary.
    pub fn pack_opaque(&mut self, data: &[u8]) {
        self.pack_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        let pad = padded_len(data.len()) - data.len();
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    /// Pack a UTF-8 string the same way as opaque bytes.
    pub fn pack_string(&mut self, s: &str) {
        self.pack_opaque(s.as_bytes());
    }

    /// Pack a u32 element count followed by each element via `each`.
    pub fn pack_array<T>(&mut self, items: &[T], mut each: impl FnMut(&mut Self, &T)) {
        self.pack_u32(items.len() as u32);
        for item in items {
            each(self, item);
        }
    }
}

/// Cursor-based XDR unpacker over a borrowed byte slice.
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    /// Wrap a buffer for decoding.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], XdrError> {
        let end = self.pos.checked_add(n).ok_or(XdrError::InvalidLength)?;
        let slice = self.buf.get(self.pos..end).ok_or(XdrError::Eof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Unpack a plain u32.
    pub fn unpack_u32(&mut self) -> Result<u32, XdrError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Unpack a u64 encoded as two big-endian u32s (high, low).
    pub fn unpack_u64(&mut self) -> Result<u64, XdrError> {
        let hi = self.unpack_u32()? as u64;
        let lo = self.unpack_u32()? as u64;
        Ok((hi << 32) | lo)
    }

    /// Unpack length-prefixed opaque bytes, consuming its 4-byte padding.
    pub fn unpack_opaque(&mut self) -> Result<Vec<u8>, XdrError> {
        let len = self.unpack_u32()? as usize;
        let data = self.take(len)?.to_vec();
        let pad = padded_len(len) - len;
        if pad > 0 {
            self.take(pad)?;
        }
        Ok(data)
    }

    /// Unpack a length-prefixed UTF-8 string.
    pub fn unpack_string(&mut self) -> Result<String, XdrError> {
        let bytes = self.unpack_opaque()?;
        String::from_utf8(bytes).map_err(|_| XdrError::InvalidUtf8)
    }

    /// Unpack a u32 element count followed by `count` elements via `each`.
    pub fn unpack_array<T>(
        &mut self,
        mut each: impl FnMut(&mut Self) -> Result<T, XdrError>,
    ) -> Result<Vec<T>, XdrError> {
        let count = self.unpack_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            out.push(each(self)?);
        }
        Ok(out)
    }

    /// Remaining unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
