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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Framed connection over any `AsyncRead + AsyncWrite` stream: a plain TCP
//! socket, a TLS stream, or (in tests) a `tokio::io::duplex` pipe.
//!
//! A connection splits into a [`ConnectionReader`], owned exclusively by the
//! task driving the session's recv loop, and a shareable [`ConnectionWriter`]
//! that the same session, its heartbeat timer, and outbound request callers
//! can all hold an `Arc` to. Neither half knows about session state or
//! dispatch.

use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::core::codec::{self, CompressionPolicy, FrameError, MSG_ID_MODULUS};
use crate::core::message::Message;
use crate::monitoring::Metrics;

/// Errors surfaced by a connection's recv/send path.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed the stream (or it errored) mid-read.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame failed to decode.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// The peer sent a frame larger than this connection will buffer.
    #[error("frame of {0} bytes exceeds the {1}-byte limit")]
    FrameTooLarge(usize, usize),
}

/// Refuse to buffer a single frame larger than this. BEP bodies are block
/// requests/responses and index batches; nothing legitimate approaches 64 MiB.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Shared counters both halves update: last-activity timestamps and the
/// outgoing msg_id sequence.
#[derive(Debug)]
struct ConnectionState {
    next_msg_id: AtomicU16,
    last_recv_millis: AtomicI64,
    last_send_millis: AtomicI64,
}

impl ConnectionState {
    fn new() -> Self {
        let now = now_unix_millis();
        Self {
            next_msg_id: AtomicU16::new(0),
            last_recv_millis: AtomicI64::new(now),
            last_send_millis: AtomicI64::new(now),
        }
    }

    fn next_msg_id(&self) -> u16 {
        let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        (u32::from(id) % MSG_ID_MODULUS) as u16
    }
}

/// Split a stream into its independently owned read and (shareable) write
/// halves.
pub fn connection<S>(
    stream: S,
    compression: CompressionPolicy,
    metrics: std::sync::Arc<Metrics>,
) -> (ConnectionReader<S>, ConnectionWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, write_half) = split(stream);
    let state = std::sync::Arc::new(ConnectionState::new());
    let reader = ConnectionReader {
        read_half,
        read_buf: Vec::with_capacity(4096),
        state: state.clone(),
        metrics: metrics.clone(),
    };
    let writer = ConnectionWriter {
        write_half: Mutex::new(write_half),
        compression,
        state,
        metrics,
    };
    (reader, writer)
}

/// Owns the stream's read half and inbound frame buffer. Meant to be moved
/// into the single task that drives a session's recv loop.
pub struct ConnectionReader<S> {
    read_half: ReadHalf<S>,
    read_buf: Vec<u8>,
    state: std::sync::Arc<ConnectionState>,
    metrics: std::sync::Arc<Metrics>,
}

impl<S: AsyncRead + Unpin + Send> ConnectionReader<S> {
    /// Read and decode the next complete frame.
    ///
    /// Frames naming an unsupported version or an unknown `msg_type` are not
    /// errors: they are silently consumed and this loops around for the
    /// next one, matching the "drop the frame, keep reading" escape hatch
    /// forward compatibility requires. Returns `Ok(None)` only when the
    /// peer closes the stream cleanly at a frame boundary.
    pub async fn recv(&mut self) -> Result<Option<Message>, ConnectionError> {
        loop {
            if let Some((_, total)) = codec::peek_header(&self.read_buf)? {
                if total > MAX_FRAME_LEN {
                    return Err(ConnectionError::FrameTooLarge(total, MAX_FRAME_LEN));
                }
                if self.read_buf.len() >= total {
                    let frame: Vec<u8> = self.read_buf.drain(..total).collect();
                    self.state.last_recv_millis.store(now_unix_millis(), Ordering::Relaxed);
                    match codec::decode_frame(&frame) {
                        Ok(message) => {
                            self.metrics.frames_recv_total.inc();
                            return Ok(Some(message));
                        }
                        Err(FrameError::UnsupportedVersion(_)) | Err(FrameError::UnknownMessageType(_)) => {
                            self.metrics.unknown_frames_total.inc();
                            continue;
                        }
                        Err(e) => {
                            self.metrics.decode_errors_total.inc();
                            return Err(e.into());
                        }
                    }
                }
            }

            let mut chunk = [0u8; 4096];
            let n = self.read_half.read(&mut chunk).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection mid-frame",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Milliseconds since the epoch of the last successful receive.
    pub fn last_recv_millis(&self) -> i64 {
        self.state.last_recv_millis.load(Ordering::Relaxed)
    }
}

/// Owns the stream's write half behind a lock, so it can be shared (usually
/// via `Arc`) between a session's dispatch loop, its heartbeat timer, and
/// callers awaiting a request's response.
pub struct ConnectionWriter<S> {
    write_half: Mutex<WriteHalf<S>>,
    compression: CompressionPolicy,
    state: std::sync::Arc<ConnectionState>,
    metrics: std::sync::Arc<Metrics>,
}

impl<S: AsyncWrite + Unpin + Send> ConnectionWriter<S> {
    /// Allocate the next outgoing `msg_id`, wrapping at [`MSG_ID_MODULUS`].
    pub fn next_msg_id(&self) -> u16 {
        self.state.next_msg_id()
    }

    /// Encode and write one message, serialized against concurrent senders.
    pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        let frame = codec::encode_frame(message, self.compression);
        if let Some((header, _)) = codec::peek_header(&frame)? {
            if header.compressed {
                self.metrics.frames_compressed_total.inc();
            }
        }
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(&frame).await?;
        write_half.flush().await?;
        drop(write_half);
        self.state.last_send_millis.store(now_unix_millis(), Ordering::Relaxed);
        self.metrics.frames_sent_total.inc();
        Ok(())
    }

    /// Shut down the write half, signalling the peer no more data follows.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await?;
        Ok(())
    }

    /// Milliseconds since the epoch of the last successful send.
    pub fn last_send_millis(&self) -> i64 {
        self.state.last_send_millis.load(Ordering::Relaxed)
    }
}
