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

//! The process-wide registry sitting between the session layer and
//! persistence: the set of currently connected peers, translation of
//! decoded messages into `Storage` calls, and the fan-out that turns "local
//! content changed" into outgoing `IndexUpdate`s.
//!
//! Session state (handshake/liveness, heartbeats, request correlation)
//! belongs to `networking::session`; this module only owns *what a message
//! means* and *what the local index currently looks like*.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::core::identity::DeviceId;
use crate::core::message::{ClusterConfig, IndexPayload, Options, Request, Response, ResponseCode};
use crate::networking::session::SessionHandle;
use crate::storage::{DeviceRecord, Storage, StorageError};

/// Errors raised while servicing a decoded message against the model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// `Model::request` could not locate the named file.
    #[error("no such file")]
    NoSuchFile,
    /// `Model::request`'s arguments did not validate (e.g. a sha mismatch).
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The persistence collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Static identity and handshake attributes this endpoint announces to
/// every peer. Not itself the wire `ClusterConfig`: `Model::cluster_config`
/// combines this with whichever folders are configured to be shared with a
/// given peer.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    /// This endpoint's own device id, used to reject self-connections and
    /// to read back its own local file index.
    pub device_id: DeviceId,
    /// Announced in every outbound `ClusterConfig`.
    pub client_name: String,
    /// Announced in every outbound `ClusterConfig`.
    pub client_version: String,
}

/// A device announced by an `INTRODUCER` peer that this endpoint has never
/// seen before. Connecting to it is out of scope (peer network addresses
/// are assumed supplied, per the purpose statement); this only records the
/// request so a caller — or a test — can observe it.
pub type DialRequest = DeviceId;

/// The process-wide peer registry and index router.
///
/// Generic over the same stream type `S` every `Session` in the process
/// uses, since it holds each peer's `SessionHandle<S>` for the lifetime of
/// its TCP connection.
pub struct Model<S> {
    identity: LocalIdentity,
    storage: Arc<dyn Storage>,
    sessions: Mutex<HashMap<DeviceId, Arc<SessionHandle<S>>>>,
    dial_tx: mpsc::Sender<DialRequest>,
}

impl<S> Model<S>
where
    S: AsyncWrite + Unpin + Send,
{
    /// Construct a model, returning it alongside the receiving half of its
    /// introducer dial-request channel.
    pub fn new(identity: LocalIdentity, storage: Arc<dyn Storage>) -> (Self, mpsc::Receiver<DialRequest>) {
        let (dial_tx, dial_rx) = mpsc::channel(64);
        (
            Self {
                identity,
                storage,
                sessions: Mutex::new(HashMap::new()),
                dial_tx,
            },
            dial_rx,
        )
    }

    /// This endpoint's own device id.
    pub fn self_id(&self) -> DeviceId {
        self.identity.device_id
    }

    /// Whether `id` names this endpoint itself.
    pub fn is_self(&self, id: &DeviceId) -> bool {
        *id == self.identity.device_id
    }

    /// Whether a session is already registered for `id`.
    pub async fn has_session(&self, id: &DeviceId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Register a newly accepted or dialed session. Returns `false` (and
    /// does not replace the existing entry) if a session for this peer is
    /// already registered — the caller should reject the duplicate
    /// connection rather than race two sessions over one device id.
    pub async fn register_session(&self, handle: Arc<SessionHandle<S>>) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&handle.device_id()) {
            return false;
        }
        sessions.insert(handle.device_id(), handle);
        true
    }

    /// Remove a session on transport close or explicit `Close`. Idempotent.
    pub async fn on_session_closed(&self, device_id: DeviceId) {
        self.sessions.lock().await.remove(&device_id);
    }

    /// Number of currently registered sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Build the outbound `ClusterConfig` for `peer_id`: this endpoint's
    /// identity plus every folder locally configured to be shared with it.
    pub fn cluster_config(&self, peer_id: &DeviceId) -> ClusterConfig {
        let folders = self.storage.get_folders_for(peer_id).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read folders for cluster config, sending none");
            Vec::new()
        });
        ClusterConfig {
            name: self.identity.client_name.clone(),
            version: self.identity.client_version.clone(),
            folders,
            options: Options::new(),
        }
    }

    /// Handle an inbound `ClusterConfig`: persist the peer's announced
    /// attributes, and — if the peer marks itself `INTRODUCER` in a shared
    /// folder — enqueue a dial request for every device that folder lists
    /// that this endpoint has not seen before.
    pub async fn on_cluster_config(&self, peer_id: DeviceId, cc: ClusterConfig) {
        let record = DeviceRecord {
            ident: peer_id,
            name: cc.name.clone(),
            client_version: cc.version.clone(),
            max_local_version: 0,
            flags: 0,
            options: cc.options.clone(),
        };
        if let Err(e) = self.storage.upsert_device(&record) {
            warn!(error = %e, "failed to persist device attributes from ClusterConfig");
        }

        let locally_shared = match self.storage.get_folders_for(&peer_id) {
            Ok(folders) => folders,
            Err(e) => {
                warn!(error = %e, "failed to read locally configured folders");
                return;
            }
        };
        let locally_shared_idents: std::collections::HashSet<&str> =
            locally_shared.iter().map(|f| f.ident.as_str()).collect();

        for folder in &cc.folders {
            if !locally_shared_idents.contains(folder.ident.as_str()) {
                // The peer announced a folder we have not configured to
                // share with it; ignore rather than trust an unsolicited
                // membership claim.
                continue;
            }
            let Some(peer_entry) = folder.devices.iter().find(|d| d.ident == peer_id) else {
                continue;
            };
            if !peer_entry.is_introducer() {
                continue;
            }
            for device in &folder.devices {
                if device.ident == self.identity.device_id || device.ident == peer_id {
                    continue;
                }
                let known = matches!(self.storage.get_device(&device.ident), Ok(Some(_)));
                if known {
                    continue;
                }
                if self.dial_tx.try_send(device.ident).is_err() {
                    debug!("dial request queue full, dropping introducer fan-out for a device");
                }
            }
        }
    }

    /// Handle a full `Index` snapshot: replace the peer's known file set
    /// for that folder wholesale.
    pub async fn on_index(&self, peer_id: DeviceId, payload: IndexPayload) {
        if let Err(e) = self.storage.replace_files(&payload.folder, &peer_id, &payload.files) {
            warn!(error = %e, folder = %payload.folder, "failed to replace files from Index");
        }
    }

    /// Handle an `IndexUpdate` delta: merge each entry into the peer's
    /// known file set by name, via the storage layer's monotonic merge.
    pub async fn on_index_update(&self, peer_id: DeviceId, payload: IndexPayload) {
        for file in &payload.files {
            if let Err(e) = self.storage.upsert_file_info(&payload.folder, &peer_id, file) {
                warn!(error = %e, folder = %payload.folder, file = %file.name, "failed to upsert file from IndexUpdate");
            }
        }
    }

    /// Service a `Request`, mapping the outcome onto the wire's
    /// `ResponseCode`s. Never returns an `Err`: every failure has a defined
    /// response, matching the dispatch table in the session layer.
    pub async fn on_request(&self, _peer_id: DeviceId, req: Request) -> Response {
        let sha = if req.sha.is_empty() { None } else { Some(req.sha.as_slice()) };
        match self.request(&req.folder, &req.name, req.offset, req.size, sha) {
            Ok(data) => Response {
                data,
                code: ResponseCode::NoError,
            },
            Err(ModelError::NoSuchFile) => Response {
                data: Vec::new(),
                code: ResponseCode::NoSuchFile,
            },
            Err(ModelError::Invalid(reason)) => {
                debug!(reason, "rejecting invalid block request");
                Response {
                    data: Vec::new(),
                    code: ResponseCode::Invalid,
                }
            }
            Err(ModelError::Storage(e)) => {
                warn!(error = %e, "storage error servicing block request");
                Response {
                    data: Vec::new(),
                    code: ResponseCode::Error,
                }
            }
        }
    }

    /// Read `size` bytes at `offset` from `folder/name`, verifying `sha`
    /// against the block's recorded hash when one is supplied.
    pub fn request(
        &self,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        sha: Option<&[u8]>,
    ) -> Result<Vec<u8>, ModelError> {
        if size == 0 {
            return Err(ModelError::Invalid("zero-length block request".into()));
        }
        match self.storage.get_block(folder, name, offset, size, sha) {
            Ok(data) => Ok(data),
            Err(StorageError::NoSuchFile(_, _)) => Err(ModelError::NoSuchFile),
            Err(StorageError::Invalid(reason)) => Err(ModelError::Invalid(reason)),
            Err(other) => Err(ModelError::Storage(other)),
        }
    }

    /// Fire the "local content changed" signal: wake every registered
    /// session's fan-out loop so each re-checks which of its shared
    /// folders have files with a newer `local_version` than the peer has
    /// acknowledged.
    pub async fn signal_update(&self) {
        let sessions = self.sessions.lock().await;
        for handle in sessions.values() {
            handle.signal_update();
        }
    }

    /// Push an `IndexUpdate` to `handle` for every folder shared with its
    /// peer that has files newer than the peer's last-known
    /// `max_local_version`. Level-triggered: a missed wakeup just means the
    /// next one covers everything that changed since.
    pub async fn fan_out_updates(&self, handle: &Arc<SessionHandle<S>>) {
        let peer_id = handle.device_id();
        let folders = match self.storage.get_folders_for(&peer_id) {
            Ok(folders) => folders,
            Err(e) => {
                warn!(error = %e, "failed to read folders for fan-out");
                return;
            }
        };

        for folder in folders {
            let cutoff = folder
                .devices
                .iter()
                .find(|d| d.ident == peer_id)
                .map(|d| d.max_local_version)
                .unwrap_or(0);

            let files = match self.storage.list_files(&folder.ident, &self.identity.device_id) {
                Ok(files) => files,
                Err(e) => {
                    warn!(error = %e, folder = %folder.ident, "failed to list local files for fan-out");
                    continue;
                }
            };

            let changed: Vec<_> = files.into_iter().filter(|f| f.local_version > cutoff).collect();
            if changed.is_empty() {
                continue;
            }

            let payload = IndexPayload {
                folder: folder.ident.clone(),
                files: changed,
                flags: 0,
                options: Options::new(),
            };
            if let Err(e) = handle.send_index_update(payload).await {
                warn!(device = %hex::encode(peer_id), error = %e, "failed to send fan-out IndexUpdate");
            }
        }
    }
}
