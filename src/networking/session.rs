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

//! Per-peer session: the NEW -> HANDSHAKING -> READY -> CLOSED state
//! machine, heartbeats, request/response correlation, and the fan-out
//! trigger used to push index updates as soon as local state changes.
//! Dispatch of *what a message means* belongs to `model`; this module
//! only owns *when to send what* and *which in-flight request a response
//! answers*.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::identity::DeviceId;
use crate::core::message::{ClusterConfig, Close, IndexPayload, Message, Request, Response, ResponseCode};
use crate::model::Model;
use crate::monitoring::Metrics;

use super::connection::{ConnectionError, ConnectionReader, ConnectionWriter};

/// A session's position in its handshake/liveness state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted or dialed, nothing exchanged yet.
    New,
    /// A `ClusterConfig` has been sent or received, but not both.
    Handshaking,
    /// Both sides have exchanged `ClusterConfig`; indexes may flow.
    Ready,
    /// The session has sent or received `Close` (or errored) and is done.
    Closed,
}

/// Errors from session-level operations (as opposed to raw connection I/O).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying connection failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    /// A `request` call's timeout elapsed before a `Response` arrived.
    #[error("request timed out waiting for a response")]
    Timeout,
    /// The session closed while a `request` call was still pending.
    #[error("session closed before a response arrived")]
    Closed,
    /// The peer repeated its `ClusterConfig` after the session was already
    /// `Ready`, which this protocol treats as a fatal handshake violation.
    #[error("peer resent ClusterConfig after the session was already ready")]
    DuplicateClusterConfig,
}

/// A peer's session, shared between the task driving its recv loop, its
/// heartbeat timer, and any caller issuing a `request`.
pub struct SessionHandle<S> {
    device_id: DeviceId,
    writer: Arc<ConnectionWriter<S>>,
    state: RwLock<SessionState>,
    pending: Mutex<HashMap<u16, oneshot::Sender<Response>>>,
    update_signal: Notify,
}

impl<S> SessionHandle<S>
where
    S: AsyncWrite + Unpin + Send,
{
    fn new(device_id: DeviceId, writer: Arc<ConnectionWriter<S>>) -> Self {
        Self {
            device_id,
            writer,
            state: RwLock::new(SessionState::New),
            pending: Mutex::new(HashMap::new()),
            update_signal: Notify::new(),
        }
    }

    /// The peer's device identity.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Current handshake/liveness state.
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, next: SessionState) {
        *self.state.write().await = next;
    }

    /// Wake this session's fan-out loop so it re-checks the model for index
    /// updates to push. Cheap and idempotent to call repeatedly.
    pub fn signal_update(&self) {
        self.update_signal.notify_one();
    }

    /// Send this side's `ClusterConfig`, advancing `New`/`Handshaking` state.
    pub async fn send_cluster_config(&self, cc: ClusterConfig) -> Result<(), SessionError> {
        let msg_id = self.writer.next_msg_id();
        self.writer.send(&Message::ClusterConfig(msg_id, cc)).await?;
        let mut state = self.state.write().await;
        *state = match *state {
            SessionState::New => SessionState::Handshaking,
            SessionState::Handshaking => SessionState::Ready,
            other => other,
        };
        Ok(())
    }

    /// Send a full index snapshot for a folder.
    pub async fn send_index(&self, payload: IndexPayload) -> Result<(), SessionError> {
        let msg_id = self.writer.next_msg_id();
        self.writer.send(&Message::Index(msg_id, payload)).await?;
        Ok(())
    }

    /// Send an incremental index update for a folder.
    pub async fn send_index_update(&self, payload: IndexPayload) -> Result<(), SessionError> {
        let msg_id = self.writer.next_msg_id();
        self.writer.send(&Message::IndexUpdate(msg_id, payload)).await?;
        Ok(())
    }

    /// Send a `Ping` heartbeat probe.
    pub async fn send_ping(&self) -> Result<(), SessionError> {
        let msg_id = self.writer.next_msg_id();
        self.writer.send(&Message::Ping(msg_id)).await?;
        Ok(())
    }

    /// Issue a block request and await its correlated response, or time out.
    pub async fn request(&self, req: Request, timeout: Duration) -> Result<Response, SessionError> {
        let msg_id = self.writer.next_msg_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(msg_id, tx);

        if let Err(e) = self.writer.send(&Message::Request(msg_id, req)).await {
            self.pending.lock().await.remove(&msg_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&msg_id);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Send a `Response` answering a peer's `Request` by `msg_id`.
    async fn reply(&self, msg_id: u16, response: Response) -> Result<(), SessionError> {
        self.writer.send(&Message::Response(msg_id, response)).await?;
        Ok(())
    }

    /// Send `Close` and shut down the underlying stream.
    pub async fn close(&self, reason: impl Into<String>, code: ResponseCode) {
        let msg_id = self.writer.next_msg_id();
        let close = Close {
            reason: reason.into(),
            code,
        };
        if let Err(e) = self.writer.send(&Message::Close(msg_id, close)).await {
            debug!(?e, "failed to send Close, closing anyway");
        }
        let _ = self.writer.close().await;
        self.set_state(SessionState::Closed).await;
        self.fail_all_pending().await;
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        pending.clear();
    }
}

/// How long a session may sit idle before it sends an unsolicited `Ping`,
/// and the multiple of that interval after which a silent peer is dropped.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    /// Interval between idle checks and the threshold for sending a `Ping`.
    pub ping_idle: Duration,
    /// Multiple of `ping_idle` of total silence before the peer is dropped.
    pub idle_timeout_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_idle: Duration::from_secs(60),
            idle_timeout_multiplier: 2,
        }
    }
}

/// Drive one session to completion: read frames, dispatch them to `model`,
/// answer requests, send heartbeats, and push index updates when signalled.
/// Returns once the connection closes, in either direction.
pub async fn run_session<S>(
    mut reader: ConnectionReader<S>,
    handle: Arc<SessionHandle<S>>,
    model: Arc<Model<S>>,
    heartbeat: HeartbeatConfig,
    metrics: Arc<Metrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval(heartbeat.ping_idle / 2);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = reader.recv() => {
                match received {
                    Ok(Some(message)) => {
                        if let Err(e) = dispatch(&message, &handle, &model, &metrics).await {
                            warn!(device = %hex::encode(handle.device_id()), error = %e, "session terminated by dispatch");
                            handle.set_state(SessionState::Closed).await;
                            handle.fail_all_pending().await;
                            model.on_session_closed(handle.device_id()).await;
                            metrics.sessions_active.dec();
                            return;
                        }
                    }
                    Ok(None) => {
                        info!(device = %hex::encode(handle.device_id()), "peer closed connection cleanly");
                        handle.set_state(SessionState::Closed).await;
                        handle.fail_all_pending().await;
                        model.on_session_closed(handle.device_id()).await;
                        metrics.sessions_active.dec();
                        return;
                    }
                    Err(e) => {
                        info!(device = %hex::encode(handle.device_id()), error = %e, "session recv loop ended");
                        handle.set_state(SessionState::Closed).await;
                        handle.fail_all_pending().await;
                        model.on_session_closed(handle.device_id()).await;
                        metrics.sessions_active.dec();
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let idle_for = now_millis().saturating_sub(reader.last_recv_millis());
                let idle_limit_ms = heartbeat.ping_idle.as_millis() as i64
                    * i64::from(heartbeat.idle_timeout_multiplier);
                if idle_for >= idle_limit_ms {
                    info!(device = %hex::encode(handle.device_id()), "peer idle past timeout, closing");
                    handle.close("ping timeout", ResponseCode::Error).await;
                    model.on_session_closed(handle.device_id()).await;
                    metrics.sessions_active.dec();
                    return;
                }
                if idle_for >= heartbeat.ping_idle.as_millis() as i64 {
                    if let Err(e) = handle.send_ping().await {
                        warn!(device = %hex::encode(handle.device_id()), error = %e, "failed to send heartbeat ping");
                        metrics.sessions_active.dec();
                        return;
                    }
                }
            }
            _ = handle.update_signal.notified() => {
                model.fan_out_updates(&handle).await;
            }
        }
    }
}

async fn dispatch<S>(
    message: &Message,
    handle: &Arc<SessionHandle<S>>,
    model: &Arc<Model<S>>,
    metrics: &Arc<Metrics>,
) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin + Send,
{
    match message {
        Message::ClusterConfig(_, cc) => {
            let state = handle.state().await;
            if state == SessionState::Ready {
                return Err(SessionError::DuplicateClusterConfig);
            }
            model.on_cluster_config(handle.device_id(), cc.clone()).await;
            let mut s = handle.state.write().await;
            *s = match *s {
                SessionState::New => SessionState::Handshaking,
                SessionState::Handshaking => SessionState::Ready,
                other => other,
            };
        }
        Message::Index(_, payload) => {
            model.on_index(handle.device_id(), payload.clone()).await;
        }
        Message::IndexUpdate(_, payload) => {
            model.on_index_update(handle.device_id(), payload.clone()).await;
        }
        Message::Request(msg_id, req) => {
            metrics.requests_total.inc();
            let response = model.on_request(handle.device_id(), req.clone()).await;
            metrics.record_response(response.code);
            handle.reply(*msg_id, response).await?;
        }
        Message::Response(msg_id, response) => {
            let mut pending = handle.pending.lock().await;
            if let Some(tx) = pending.remove(msg_id) {
                let _ = tx.send(response.clone());
            }
        }
        Message::Ping(_) | Message::Pong(_) => {}
        Message::Close(_, close) => {
            debug!(device = %hex::encode(handle.device_id()), reason = %close.reason, "peer sent Close");
            return Err(SessionError::Closed);
        }
    }
    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Construct a fresh, unstarted session handle for a newly accepted or
/// dialed connection.
pub fn new_handle<S>(device_id: DeviceId, writer: Arc<ConnectionWriter<S>>) -> Arc<SessionHandle<S>>
where
    S: AsyncWrite + Unpin + Send,
{
    Arc::new(SessionHandle::new(device_id, writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::CompressionPolicy;
    use crate::model::{LocalIdentity, Model};
    use crate::networking::connection::connection;
    use crate::storage::{MemoryStorage, Storage};
    use tokio::io::DuplexStream;

    fn test_model() -> Arc<Model<DuplexStream>> {
        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn Storage>;
        let identity = LocalIdentity {
            device_id: [0u8; 32],
            client_name: "local".into(),
            client_version: "v1".into(),
        };
        Arc::new(Model::new(identity, storage).0)
    }

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    fn empty_cluster_config(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.into(),
            version: "1".into(),
            folders: vec![],
            options: Default::default(),
        }
    }

    // Testable property 8: a Request's correlated Response resolves the
    // caller's pending `request()` even with Pings interleaved ahead of it.
    #[tokio::test]
    async fn request_resolves_despite_an_interleaved_ping() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (mut peer_reader, peer_writer) = connection(client_io, CompressionPolicy::Never, test_metrics());
        let (mut local_reader, local_writer) = connection(server_io, CompressionPolicy::Never, test_metrics());
        let handle = new_handle([9u8; 32], Arc::new(local_writer));
        let model = test_model();
        let metrics = test_metrics();

        let requester = handle.clone();
        let request_task = tokio::spawn(async move {
            requester
                .request(
                    Request {
                        folder: "photos".into(),
                        name: "a.jpg".into(),
                        offset: 0,
                        size: 16,
                        sha: vec![],
                        flags: 0,
                        options: Default::default(),
                    },
                    Duration::from_secs(5),
                )
                .await
        });

        let sent = peer_reader.recv().await.unwrap().unwrap();
        let msg_id = match sent {
            Message::Request(id, _) => id,
            other => panic!("expected a Request, got {other:?}"),
        };

        peer_writer.send(&Message::Ping(123)).await.unwrap();
        peer_writer
            .send(&Message::Response(
                msg_id,
                Response { data: b"hello".to_vec(), code: ResponseCode::NoError },
            ))
            .await
            .unwrap();

        for _ in 0..2 {
            let msg = local_reader.recv().await.unwrap().unwrap();
            dispatch(&msg, &handle, &model, &metrics).await.unwrap();
        }

        let response = request_task.await.unwrap().unwrap();
        assert_eq!(response.data, b"hello");
    }

    // Testable property 9: a second ClusterConfig after the session is
    // already Ready terminates dispatch instead of being merged or ignored.
    #[tokio::test]
    async fn duplicate_cluster_config_after_ready_is_rejected() {
        let (_client_io, server_io) = tokio::io::duplex(4096);
        let (_reader, writer) = connection(server_io, CompressionPolicy::Never, test_metrics());
        let handle = new_handle([1u8; 32], Arc::new(writer));
        let model = test_model();
        let metrics = test_metrics();

        handle.send_cluster_config(empty_cluster_config("local")).await.unwrap();
        assert_eq!(handle.state().await, SessionState::Handshaking);

        let first = dispatch(
            &Message::ClusterConfig(1, empty_cluster_config("peer")),
            &handle,
            &model,
            &metrics,
        )
        .await;
        assert!(first.is_ok());
        assert_eq!(handle.state().await, SessionState::Ready);

        let second = dispatch(
            &Message::ClusterConfig(2, empty_cluster_config("peer")),
            &handle,
            &model,
            &metrics,
        )
        .await;
        assert!(matches!(second, Err(SessionError::DuplicateClusterConfig)));
    }

    #[tokio::test]
    async fn close_message_terminates_dispatch() {
        let (_client_io, server_io) = tokio::io::duplex(4096);
        let (_reader, writer) = connection(server_io, CompressionPolicy::Never, test_metrics());
        let handle = new_handle([2u8; 32], Arc::new(writer));
        let model = test_model();
        let metrics = test_metrics();

        let result = dispatch(
            &Message::Close(1, Close { reason: "bye".into(), code: ResponseCode::NoError }),
            &handle,
            &model,
            &metrics,
        )
        .await;
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    // S4 Request missing: dispatch replies over the wire with NoSuchFile,
    // not just at the Model layer.
    #[tokio::test]
    async fn request_dispatch_replies_no_such_file_for_unknown_name() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (mut peer_reader, _peer_writer) = connection(client_io, CompressionPolicy::Never, test_metrics());
        let (_local_reader, local_writer) = connection(server_io, CompressionPolicy::Never, test_metrics());
        let handle = new_handle([3u8; 32], Arc::new(local_writer));
        let model = test_model();
        let metrics = test_metrics();

        dispatch(
            &Message::Request(
                7,
                Request {
                    folder: "photos".into(),
                    name: "missing.jpg".into(),
                    offset: 0,
                    size: 16,
                    sha: vec![],
                    flags: 0,
                    options: Default::default(),
                },
            ),
            &handle,
            &model,
            &metrics,
        )
        .await
        .unwrap();

        let response = peer_reader.recv().await.unwrap().unwrap();
        match response {
            Message::Response(id, r) => {
                assert_eq!(id, 7);
                assert_eq!(r.code, ResponseCode::NoSuchFile);
                assert!(r.data.is_empty());
            }
            other => panic!("expected a Response, got {other:?}"),
        }
    }
}
