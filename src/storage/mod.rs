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

//! Durable state the model consults and updates, behind a narrow
//! collaborator interface. Filesystem walking and block hashing of local
//! content are someone else's job; this module only persists what the BEP
//! session layer is told about devices, folders, and indexes, and serves
//! block bytes back out of whatever store backs it.
//!
//! [`SledStorage`] is the production backend (a single `sled::Db`, mirroring
//! the teacher's `PersistentState`). [`MemoryStorage`] is an in-process
//! substitute for tests and small deployments that don't want a data
//! directory at all.

mod memory;
mod sled_store;

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use ring::digest;
use thiserror::Error;

use crate::core::identity::DeviceId;
use crate::core::message::{FileInfo, Folder, Options};

pub use memory::MemoryStorage;
pub use sled_store::SledStorage;

/// A device this endpoint has ever exchanged a `ClusterConfig` with, plus the
/// attributes it announced. Distinct from `core::message::Device`, which is
/// the wire record listing a device's role *inside one folder*.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    /// The device's identity.
    pub ident: DeviceId,
    /// Human-readable client name it announced, if any.
    pub name: String,
    /// Client version string it announced, if any.
    pub client_version: String,
    /// Highest `local_version` this device has announced across any folder.
    pub max_local_version: u64,
    /// Packed trust/role bits, see `core::flags::device`.
    pub flags: u32,
    /// Free-form per-device options it announced.
    pub options: Options,
}

/// Errors surfaced by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store could not be opened.
    #[error("failed to open store: {0}")]
    Open(String),
    /// A read or write against the backing store failed.
    #[error("storage i/o error: {0}")]
    Io(String),
    /// A stored record did not decode to its expected shape.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// The named file has no record in this folder.
    #[error("no such file: {0}/{1}")]
    NoSuchFile(String, String),
    /// The requested block range does not exist in the file's blocks.
    #[error("invalid block request: {0}")]
    Invalid(String),
}

/// The narrow persistence interface the session layer and model consume.
/// Everything here is synchronous: both backends do local-disk or in-memory
/// work cheap enough not to warrant `spawn_blocking`, matching how the
/// teacher's `PersistentState` is called directly from async code.
pub trait Storage: Send + Sync {
    /// Look up a previously seen device's announced attributes.
    fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StorageError>;

    /// Insert or overwrite a device's announced attributes.
    fn upsert_device(&self, record: &DeviceRecord) -> Result<(), StorageError>;

    /// Every locally known device record, for introducer/fan-out bookkeeping.
    fn list_devices(&self) -> Result<Vec<DeviceRecord>, StorageError>;

    /// The folders locally configured to be shared with `id`, each carrying
    /// its own device membership list. This is the admin-provided mapping
    /// `cluster_config` reads when building an outbound `ClusterConfig`.
    fn get_folders_for(&self, id: &DeviceId) -> Result<Vec<Folder>, StorageError>;

    /// Register or update a folder's local configuration (ident, device
    /// membership, flags, options). Not part of the wire protocol; this is
    /// how an operator (or a test) seeds what `get_folders_for` later reads.
    fn upsert_folder(&self, folder: &Folder) -> Result<(), StorageError>;

    /// Bind a folder ident to the local filesystem root `get_block` reads
    /// block bytes from. Out of scope to discover automatically; supplied by
    /// configuration.
    fn set_folder_root(&self, folder: &str, root: std::path::PathBuf) -> Result<(), StorageError>;

    /// Replace one device's entire known file set for a folder (a full
    /// `Index` snapshot).
    fn replace_files(
        &self,
        folder: &str,
        owner: &DeviceId,
        files: &[FileInfo],
    ) -> Result<(), StorageError>;

    /// Upsert a single file entry into a device's known file set for a
    /// folder (used for `IndexUpdate` deltas), merging the stored version
    /// vector and `local_version` monotonically with whatever is already on
    /// file.
    fn upsert_file_info(
        &self,
        folder: &str,
        owner: &DeviceId,
        file: &FileInfo,
    ) -> Result<(), StorageError>;

    /// Every file entry known for `owner` in `folder`.
    fn list_files(&self, folder: &str, owner: &DeviceId) -> Result<Vec<FileInfo>, StorageError>;

    /// A single file entry, if known.
    fn get_file(
        &self,
        folder: &str,
        owner: &DeviceId,
        name: &str,
    ) -> Result<Option<FileInfo>, StorageError>;

    /// Read `size` bytes at `offset` from `name` within `folder`'s local
    /// root, verifying `sha` against the matching block's recorded hash
    /// when the file's `BlockInfo` entries are known.
    fn get_block(
        &self,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        sha: Option<&[u8]>,
    ) -> Result<Vec<u8>, StorageError>;
}

/// Merge an incoming `FileInfo` into whatever is already stored under the
/// same name: the version vector merges monotonically (never loses an
/// entry), and `local_version` takes the higher of the two, matching the
/// vector clock's own never-decrements rule.
pub(crate) fn merge_file_info(mut existing: FileInfo, incoming: FileInfo) -> FileInfo {
    existing.version.merge(&incoming.version);
    if incoming.local_version >= existing.local_version {
        existing.name = incoming.name;
        existing.flags = incoming.flags;
        existing.modified = incoming.modified;
        existing.local_version = incoming.local_version;
        existing.blocks = incoming.blocks;
    }
    existing
}

/// Read `size` bytes at `offset` from `root/name`, verifying `sha` (if
/// given) against the SHA-256 of the bytes actually read. The block-hashing
/// producer that fills a folder's contents is out of scope here; this only
/// serves bytes back out once they exist on disk.
pub(crate) fn read_block(
    root: &Path,
    name: &str,
    offset: u64,
    size: u32,
    sha: Option<&[u8]>,
) -> Result<Vec<u8>, StorageError> {
    let path = root.join(name);
    let mut file = std::fs::File::open(&path)
        .map_err(|_| StorageError::NoSuchFile(root.display().to_string(), name.to_string()))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| StorageError::Io(e.to_string()))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf)
        .map_err(|_| StorageError::Invalid(format!("short read at offset {offset}")))?;

    if let Some(expected) = sha {
        let actual = digest::digest(&digest::SHA256, &buf);
        if actual.as_ref() != expected {
            return Err(StorageError::Invalid("block sha mismatch".into()));
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vector_clock::VectorClock;

    fn device(b: u8) -> DeviceId {
        let mut out = [0u8; 32];
        out[0] = b;
        out
    }

    fn file(name: &str, local_version: u64) -> FileInfo {
        FileInfo {
            name: name.into(),
            flags: 0,
            modified: 0,
            version: VectorClock::new(),
            local_version,
            blocks: vec![],
        }
    }

    /// Exercises any `Storage` impl against the same behavioral contract.
    fn exercises_basic_contract(store: &dyn Storage) {
        let id = device(1);
        assert!(store.get_device(&id).unwrap().is_none());

        let record = DeviceRecord {
            ident: id,
            name: "bob".into(),
            client_version: "v0.10".into(),
            max_local_version: 0,
            flags: 0,
            options: Default::default(),
        };
        store.upsert_device(&record).unwrap();
        assert_eq!(store.get_device(&id).unwrap().unwrap().name, "bob");

        store.replace_files("photos", &id, &[file("a.jpg", 1), file("b.jpg", 2)]).unwrap();
        let files = store.list_files("photos", &id).unwrap();
        assert_eq!(files.len(), 2);

        store.upsert_file_info("photos", &id, &file("a.jpg", 5)).unwrap();
        let a = store.get_file("photos", &id, "a.jpg").unwrap().unwrap();
        assert_eq!(a.local_version, 5);

        // A stale upsert (lower local_version) must not roll the stored
        // entry backwards.
        store.upsert_file_info("photos", &id, &file("a.jpg", 2)).unwrap();
        let a = store.get_file("photos", &id, "a.jpg").unwrap().unwrap();
        assert_eq!(a.local_version, 5);
    }

    #[test]
    fn memory_storage_satisfies_the_contract() {
        exercises_basic_contract(&MemoryStorage::new());
    }

    #[test]
    fn sled_storage_satisfies_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStorage::open(dir.path()).unwrap();
        exercises_basic_contract(&store);
    }
}
