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

//! In-process `Storage` backend: a locked `HashMap` tree, with no durability
//! across restarts. Useful for tests and for running a master endpoint with
//! no data directory at all.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::core::identity::DeviceId;
use crate::core::message::{FileInfo, Folder};

use super::{merge_file_info, read_block, DeviceRecord, Storage, StorageError};

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceId, DeviceRecord>,
    folders_for: HashMap<DeviceId, Vec<Folder>>,
    folder_roots: HashMap<String, PathBuf>,
    // (folder, owner) -> (file name -> FileInfo)
    files: HashMap<(String, DeviceId), HashMap<String, FileInfo>>,
}

/// In-memory `Storage` implementation.
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    /// A fresh, empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StorageError> {
        Ok(self.inner.read().unwrap().devices.get(id).cloned())
    }

    fn upsert_device(&self, record: &DeviceRecord) -> Result<(), StorageError> {
        self.inner.write().unwrap().devices.insert(record.ident, record.clone());
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        Ok(self.inner.read().unwrap().devices.values().cloned().collect())
    }

    fn get_folders_for(&self, id: &DeviceId) -> Result<Vec<Folder>, StorageError> {
        Ok(self.inner.read().unwrap().folders_for.get(id).cloned().unwrap_or_default())
    }

    fn upsert_folder(&self, folder: &Folder) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        for device in &folder.devices {
            let entry = inner.folders_for.entry(device.ident).or_default();
            entry.retain(|f| f.ident != folder.ident);
            entry.push(folder.clone());
        }
        Ok(())
    }

    fn set_folder_root(&self, folder: &str, root: PathBuf) -> Result<(), StorageError> {
        self.inner.write().unwrap().folder_roots.insert(folder.to_string(), root);
        Ok(())
    }

    fn replace_files(
        &self,
        folder: &str,
        owner: &DeviceId,
        files: &[FileInfo],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let map = files.iter().map(|f| (f.name.clone(), f.clone())).collect();
        inner.files.insert((folder.to_string(), *owner), map);
        Ok(())
    }

    fn upsert_file_info(
        &self,
        folder: &str,
        owner: &DeviceId,
        file: &FileInfo,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let map = inner.files.entry((folder.to_string(), *owner)).or_default();
        match map.get(&file.name).cloned() {
            Some(existing) => {
                map.insert(file.name.clone(), merge_file_info(existing, file.clone()));
            }
            None => {
                map.insert(file.name.clone(), file.clone());
            }
        }
        Ok(())
    }

    fn list_files(&self, folder: &str, owner: &DeviceId) -> Result<Vec<FileInfo>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .files
            .get(&(folder.to_string(), *owner))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_file(
        &self,
        folder: &str,
        owner: &DeviceId,
        name: &str,
    ) -> Result<Option<FileInfo>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .files
            .get(&(folder.to_string(), *owner))
            .and_then(|m| m.get(name).cloned()))
    }

    fn get_block(
        &self,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        sha: Option<&[u8]>,
    ) -> Result<Vec<u8>, StorageError> {
        let root = {
            let inner = self.inner.read().unwrap();
            inner
                .folder_roots
                .get(folder)
                .cloned()
                .ok_or_else(|| StorageError::NoSuchFile(folder.to_string(), name.to_string()))?
        };
        read_block(&root, name, offset, size, sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_folder_indexes_by_every_member_device() {
        let store = MemoryStorage::new();
        let a = [1u8; 32];
        let b = [2u8; 32];
        let folder = Folder {
            ident: "photos".into(),
            devices: vec![
                crate::core::message::Device {
                    ident: a,
                    max_local_version: 0,
                    flags: 0,
                    options: Default::default(),
                },
                crate::core::message::Device {
                    ident: b,
                    max_local_version: 0,
                    flags: 0,
                    options: Default::default(),
                },
            ],
            flags: 0,
            options: Default::default(),
        };
        store.upsert_folder(&folder).unwrap();
        assert_eq!(store.get_folders_for(&a).unwrap().len(), 1);
        assert_eq!(store.get_folders_for(&b).unwrap().len(), 1);
    }
}
