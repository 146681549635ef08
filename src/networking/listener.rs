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

//! Turns an accepted, mutually authenticated stream into a running
//! [`Session`](super::session). TLS listener bootstrap and certificate
//! loading are the bootstrap layer's job (see §1 of the design); this
//! module only consumes whatever stream and peer-certificate accessor it
//! is handed, extracts the peer's [`DeviceId`], and applies the two
//! standing rejections every accepted connection is subject to: no
//! self-connections, no duplicate sessions for a peer already connected.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::core::codec::CompressionPolicy;
use crate::core::identity::{device_id_from_cert, DeviceId};
use crate::model::Model;
use crate::monitoring::Metrics;

use super::connection::connection;
use super::session::{new_handle, run_session, HeartbeatConfig};

/// Something that can yield the DER bytes of the remote peer's leaf
/// certificate, as presented during the mutual-TLS handshake. Implemented
/// for `tokio_rustls::server::TlsStream` in production; a test can satisfy
/// this with any stub carrying a fixed certificate.
pub trait PeerCertSource {
    /// The peer's leaf certificate, DER-encoded, if the handshake
    /// presented one (it always does for a connection mutual TLS accepted).
    fn peer_certificate_der(&self) -> Option<Vec<u8>>;
}

/// Why an accepted connection was not turned into a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    /// The stream completed its handshake without presenting a peer
    /// certificate at all — not possible under a correctly configured
    /// mutual-TLS listener, but checked defensively.
    #[error("peer presented no certificate")]
    NoCertificate,
    /// The peer certificate's DeviceID is this endpoint's own.
    #[error("refused self-connection")]
    SelfConnection,
    /// A session for this peer is already registered in the model.
    #[error("peer {0:x?} already has an active session")]
    DuplicatePeer(DeviceId),
}

/// Derive an accepted stream's peer [`DeviceId`] and check it against the
/// two standing rejections. Does not touch the model beyond the read-only
/// `is_self`/`has_session` checks — registration happens in
/// [`spawn_session`], atomically with inserting into the model's session
/// map, to avoid a race between two connections from the same peer racing
/// this check.
pub async fn accept_peer<S, C>(cert_source: &C, model: &Model<S>) -> Result<DeviceId, AcceptError>
where
    S: AsyncWrite + Unpin + Send,
    C: PeerCertSource,
{
    let cert_der = cert_source.peer_certificate_der().ok_or(AcceptError::NoCertificate)?;
    let device_id = device_id_from_cert(&cert_der);

    if model.is_self(&device_id) {
        return Err(AcceptError::SelfConnection);
    }
    if model.has_session(&device_id).await {
        return Err(AcceptError::DuplicatePeer(device_id));
    }
    Ok(device_id)
}

impl<IO> PeerCertSource for tokio_rustls::server::TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn peer_certificate_der(&self) -> Option<Vec<u8>> {
        let (_, conn) = self.get_ref();
        let certs = conn.peer_certificates()?;
        certs.first().map(|c| c.as_ref().to_vec())
    }
}

/// An accepted connection, already identified and cleared of the standing
/// rejections, ready to be handed to [`spawn_session`].
pub struct PeerConnection<S> {
    /// The underlying byte stream (already past its TLS handshake).
    pub stream: S,
    /// The peer's derived device id.
    pub device_id: DeviceId,
}

/// Register the session in `model`, send this endpoint's `ClusterConfig`
/// to complete the NEW -> HANDSHAKING transition, and spawn the task that
/// drives its recv loop, heartbeat, and fan-out for the life of the
/// connection. Registration and the initial send happen before the task is
/// spawned so a caller can rely on `model.has_session` reflecting this peer
/// immediately after this function returns.
pub async fn spawn_session<S>(
    conn: PeerConnection<S>,
    model: Arc<Model<S>>,
    compression: CompressionPolicy,
    heartbeat: HeartbeatConfig,
    metrics: Arc<Metrics>,
) -> Result<tokio::task::JoinHandle<()>, AcceptError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let PeerConnection { stream, device_id } = conn;
    let (reader, writer) = connection(stream, compression, metrics.clone());
    let handle = new_handle(device_id, Arc::new(writer));

    if !model.register_session(handle.clone()).await {
        return Err(AcceptError::DuplicatePeer(device_id));
    }
    metrics.sessions_active.inc();

    let cluster_config = model.cluster_config(&device_id);
    if let Err(e) = handle.send_cluster_config(cluster_config).await {
        warn!(device = %hex::encode(device_id), error = %e, "failed to send initial ClusterConfig");
        model.on_session_closed(device_id).await;
        metrics.sessions_active.dec();
        return Err(AcceptError::NoCertificate);
    }

    info!(device = %hex::encode(device_id), "session handshaking");
    Ok(tokio::spawn(async move {
        run_session(reader, handle, model, heartbeat, metrics).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocalIdentity;
    use crate::storage::MemoryStorage;

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    struct StubCertSource(Option<Vec<u8>>);

    impl PeerCertSource for StubCertSource {
        fn peer_certificate_der(&self) -> Option<Vec<u8>> {
            self.0.clone()
        }
    }

    fn test_model() -> Arc<Model<tokio::io::DuplexStream>> {
        let storage = Arc::new(MemoryStorage::new());
        let identity = LocalIdentity {
            device_id: device_id_from_cert(b"local-cert"),
            client_name: "master".into(),
            client_version: "v1.0".into(),
        };
        Arc::new(Model::new(identity, storage).0)
    }

    #[tokio::test]
    async fn rejects_missing_certificate() {
        let model = test_model();
        let err = accept_peer(&StubCertSource(None), &model).await.unwrap_err();
        assert_eq!(err, AcceptError::NoCertificate);
    }

    #[tokio::test]
    async fn rejects_self_connection() {
        let model = test_model();
        let err = accept_peer(&StubCertSource(Some(b"local-cert".to_vec())), &model)
            .await
            .unwrap_err();
        assert_eq!(err, AcceptError::SelfConnection);
    }

    #[tokio::test]
    async fn accepts_an_unknown_peer_certificate() {
        let model = test_model();
        let device_id = accept_peer(&StubCertSource(Some(b"remote-cert".to_vec())), &model)
            .await
            .unwrap();
        assert_eq!(device_id, device_id_from_cert(b"remote-cert"));
    }

    #[tokio::test]
    async fn spawn_session_rejects_a_second_connection_from_the_same_peer() {
        let model = test_model();
        let device_id = device_id_from_cert(b"remote-cert");

        let (client_a, server_a) = tokio::io::duplex(4096);
        let spawned = spawn_session(
            PeerConnection { stream: server_a, device_id },
            model.clone(),
            CompressionPolicy::Never,
            HeartbeatConfig::default(),
            test_metrics(),
        )
        .await;
        assert!(spawned.is_ok());
        drop(client_a);

        let (_client_b, server_b) = tokio::io::duplex(4096);
        let err = accept_peer(&StubCertSource(Some(b"remote-cert".to_vec())), &model)
            .await
            .unwrap_err();
        assert_eq!(err, AcceptError::DuplicatePeer(device_id));
        drop(server_b);

        spawned.unwrap().abort();
    }
}
