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

//! `sled`-backed `Storage` implementation. Keying mirrors the teacher's
//! `PersistentState`: a single `sled::Db` with a handful of prefix-separated
//! trees, values round-tripped through `bincode`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::identity::DeviceId;
use crate::core::message::{FileInfo, Folder};

use super::{merge_file_info, read_block, DeviceRecord, Storage, StorageError};

const TREE_DEVICES: &str = "devices";
const TREE_FOLDERS: &str = "folders_for";
const TREE_FOLDER_ROOTS: &str = "folder_roots";
const TREE_FILES: &str = "files";

#[derive(Serialize, Deserialize)]
struct WireDeviceRecord {
    ident: DeviceId,
    name: String,
    client_version: String,
    max_local_version: u64,
    flags: u32,
    options: Vec<(String, String)>,
}

impl From<&DeviceRecord> for WireDeviceRecord {
    fn from(r: &DeviceRecord) -> Self {
        Self {
            ident: r.ident,
            name: r.name.clone(),
            client_version: r.client_version.clone(),
            max_local_version: r.max_local_version,
            flags: r.flags,
            options: r.options.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

impl From<WireDeviceRecord> for DeviceRecord {
    fn from(w: WireDeviceRecord) -> Self {
        Self {
            ident: w.ident,
            name: w.name,
            client_version: w.client_version,
            max_local_version: w.max_local_version,
            flags: w.flags,
            options: w.options.into_iter().collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireDevice {
    ident: DeviceId,
    max_local_version: u64,
    flags: u32,
    options: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize)]
struct WireFolder {
    ident: String,
    devices: Vec<WireDevice>,
    flags: u32,
    options: Vec<(String, String)>,
}

impl From<&Folder> for WireFolder {
    fn from(f: &Folder) -> Self {
        Self {
            ident: f.ident.clone(),
            devices: f
                .devices
                .iter()
                .map(|d| WireDevice {
                    ident: d.ident,
                    max_local_version: d.max_local_version,
                    flags: d.flags,
                    options: d.options.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                })
                .collect(),
            flags: f.flags,
            options: f.options.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

impl From<WireFolder> for Folder {
    fn from(w: WireFolder) -> Self {
        Self {
            ident: w.ident,
            devices: w
                .devices
                .into_iter()
                .map(|d| crate::core::message::Device {
                    ident: d.ident,
                    max_local_version: d.max_local_version,
                    flags: d.flags,
                    options: d.options.into_iter().collect(),
                })
                .collect(),
            flags: w.flags,
            options: w.options.into_iter().collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFileInfo {
    name: String,
    flags: u32,
    modified: u64,
    version: Vec<(DeviceId, u64)>,
    local_version: u64,
    blocks: Vec<(u32, Vec<u8>)>,
}

impl From<&FileInfo> for WireFileInfo {
    fn from(f: &FileInfo) -> Self {
        Self {
            name: f.name.clone(),
            flags: f.flags,
            modified: f.modified,
            version: f.version.iter().map(|(id, v)| (*id, *v)).collect(),
            local_version: f.local_version,
            blocks: f.blocks.iter().map(|b| (b.size, b.sha.clone())).collect(),
        }
    }
}

impl From<WireFileInfo> for FileInfo {
    fn from(w: WireFileInfo) -> Self {
        Self {
            name: w.name,
            flags: w.flags,
            modified: w.modified,
            version: crate::core::vector_clock::VectorClock::from_pairs(w.version),
            local_version: w.local_version,
            blocks: w
                .blocks
                .into_iter()
                .map(|(size, sha)| crate::core::message::BlockInfo { size, sha })
                .collect(),
        }
    }
}

/// `sled`-backed durable store.
#[derive(Clone)]
pub struct SledStorage {
    devices: sled::Tree,
    folders_for: sled::Tree,
    folder_roots: sled::Tree,
    files: sled::Tree,
}

fn io_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn corrupt_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt(e.to_string())
}

fn file_key(folder: &str, owner: &DeviceId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(folder.len() + 32 + name.len() + 2);
    key.extend_from_slice(folder.as_bytes());
    key.push(0);
    key.extend_from_slice(owner);
    key.push(0);
    key.extend_from_slice(name.as_bytes());
    key
}

fn file_prefix(folder: &str, owner: &DeviceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(folder.len() + 32 + 1);
    key.extend_from_slice(folder.as_bytes());
    key.push(0);
    key.extend_from_slice(owner);
    key.push(0);
    key
}

impl SledStorage {
    /// Open (or create) a `sled` database rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Open(e.to_string()))?;
        Ok(Self {
            devices: db.open_tree(TREE_DEVICES).map_err(io_err)?,
            folders_for: db.open_tree(TREE_FOLDERS).map_err(io_err)?,
            folder_roots: db.open_tree(TREE_FOLDER_ROOTS).map_err(io_err)?,
            files: db.open_tree(TREE_FILES).map_err(io_err)?,
        })
    }
}

impl Storage for SledStorage {
    fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StorageError> {
        match self.devices.get(id).map_err(io_err)? {
            None => Ok(None),
            Some(raw) => {
                let wire: WireDeviceRecord = bincode::deserialize(&raw).map_err(corrupt_err)?;
                Ok(Some(wire.into()))
            }
        }
    }

    fn upsert_device(&self, record: &DeviceRecord) -> Result<(), StorageError> {
        let wire = WireDeviceRecord::from(record);
        let bytes = bincode::serialize(&wire).map_err(corrupt_err)?;
        self.devices.insert(record.ident, bytes).map_err(io_err)?;
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.devices.iter() {
            let (_, raw) = item.map_err(io_err)?;
            let wire: WireDeviceRecord = bincode::deserialize(&raw).map_err(corrupt_err)?;
            out.push(wire.into());
        }
        Ok(out)
    }

    fn get_folders_for(&self, id: &DeviceId) -> Result<Vec<Folder>, StorageError> {
        match self.folders_for.get(id).map_err(io_err)? {
            None => Ok(Vec::new()),
            Some(raw) => {
                let wire: Vec<WireFolder> = bincode::deserialize(&raw).map_err(corrupt_err)?;
                Ok(wire.into_iter().map(Folder::from).collect())
            }
        }
    }

    fn upsert_folder(&self, folder: &Folder) -> Result<(), StorageError> {
        for device in &folder.devices {
            let mut existing = self.get_folders_for(&device.ident)?;
            existing.retain(|f| f.ident != folder.ident);
            existing.push(folder.clone());
            let wire: Vec<WireFolder> = existing.iter().map(WireFolder::from).collect();
            let bytes = bincode::serialize(&wire).map_err(corrupt_err)?;
            self.folders_for.insert(device.ident, bytes).map_err(io_err)?;
        }
        Ok(())
    }

    fn set_folder_root(&self, folder: &str, root: PathBuf) -> Result<(), StorageError> {
        let bytes = root.to_string_lossy().into_owned().into_bytes();
        self.folder_roots.insert(folder.as_bytes(), bytes).map_err(io_err)?;
        Ok(())
    }

    fn replace_files(
        &self,
        folder: &str,
        owner: &DeviceId,
        files: &[FileInfo],
    ) -> Result<(), StorageError> {
        let prefix = file_prefix(folder, owner);
        let stale: Vec<_> = self
            .files
            .scan_prefix(&prefix)
            .keys()
            .filter_map(Result::ok)
            .collect();
        for key in stale {
            self.files.remove(key).map_err(io_err)?;
        }
        for file in files {
            let key = file_key(folder, owner, &file.name);
            let wire = WireFileInfo::from(file);
            let bytes = bincode::serialize(&wire).map_err(corrupt_err)?;
            self.files.insert(key, bytes).map_err(io_err)?;
        }
        Ok(())
    }

    fn upsert_file_info(
        &self,
        folder: &str,
        owner: &DeviceId,
        file: &FileInfo,
    ) -> Result<(), StorageError> {
        let key = file_key(folder, owner, &file.name);
        let merged = match self.files.get(&key).map_err(io_err)? {
            Some(raw) => {
                let wire: WireFileInfo = bincode::deserialize(&raw).map_err(corrupt_err)?;
                merge_file_info(wire.into(), file.clone())
            }
            None => file.clone(),
        };
        let wire = WireFileInfo::from(&merged);
        let bytes = bincode::serialize(&wire).map_err(corrupt_err)?;
        self.files.insert(key, bytes).map_err(io_err)?;
        Ok(())
    }

    fn list_files(&self, folder: &str, owner: &DeviceId) -> Result<Vec<FileInfo>, StorageError> {
        let prefix = file_prefix(folder, owner);
        let mut out = Vec::new();
        for item in self.files.scan_prefix(&prefix) {
            let (_, raw) = item.map_err(io_err)?;
            let wire: WireFileInfo = bincode::deserialize(&raw).map_err(corrupt_err)?;
            out.push(wire.into());
        }
        Ok(out)
    }

    fn get_file(
        &self,
        folder: &str,
        owner: &DeviceId,
        name: &str,
    ) -> Result<Option<FileInfo>, StorageError> {
        let key = file_key(folder, owner, name);
        match self.files.get(key).map_err(io_err)? {
            None => Ok(None),
            Some(raw) => {
                let wire: WireFileInfo = bincode::deserialize(&raw).map_err(corrupt_err)?;
                Ok(Some(wire.into()))
            }
        }
    }

    fn get_block(
        &self,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        sha: Option<&[u8]>,
    ) -> Result<Vec<u8>, StorageError> {
        let raw_root = self
            .folder_roots
            .get(folder.as_bytes())
            .map_err(io_err)?
            .ok_or_else(|| StorageError::NoSuchFile(folder.to_string(), name.to_string()))?;
        let root = PathBuf::from(String::from_utf8_lossy(&raw_root).into_owned());
        read_block(&root, name, offset, size, sha)
    }
}
