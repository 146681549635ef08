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

//! Wire message bodies: the XDR schema for every BEP message kind, plus the
//! nested `Folder`/`Device`/`FileInfo`/`BlockInfo` records they carry.

use std::collections::HashMap;

use super::flags::{device as device_flags, file_info as file_info_flags};
use super::identity::DeviceId;
use super::vector_clock::VectorClock;
use super::xdr::{Packer, Unpacker, XdrError};

/// Unordered string options, as carried by every top-level message and by
/// `Folder`/`Device`. Equality ignores insertion order by construction.
pub type Options = HashMap<String, String>;

fn pack_options(p: &mut Packer, options: &Options) {
    let pairs: Vec<(&String, &String)> = options.iter().collect();
    p.pack_array(&pairs, |p, (k, v)| {
        p.pack_string(k);
        p.pack_string(v);
    });
}

fn unpack_options(u: &mut Unpacker<'_>) -> Result<Options, XdrError> {
    let pairs = u.unpack_array(|u| Ok((u.unpack_string()?, u.unpack_string()?)))?;
    Ok(pairs.into_iter().collect())
}

/// A block of a file: its size and the SHA-256 of its plaintext. Offset
/// within the file is implicit from the block's index in `FileInfo::blocks`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block size in bytes (the final block of a file may be short).
    pub size: u32,
    /// SHA-256 of the block's plaintext.
    pub sha: Vec<u8>,
}

impl BlockInfo {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(self.size);
        p.pack_opaque(&self.sha);
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            size: u.unpack_u32()?,
            sha: u.unpack_opaque()?,
        })
    }
}

/// A file or directory entry as known to the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Path relative to the folder root.
    pub name: String,
    /// Packed mode/type bits, see `core::flags::file_info`.
    pub flags: u32,
    /// Last-modified time, seconds since the epoch.
    pub modified: u64,
    /// Version vector governing conflict resolution.
    pub version: VectorClock,
    /// Monotonic per-device-per-folder sequence number.
    pub local_version: u64,
    /// Blocks making up the file's content, in order.
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    fn pack(&self, p: &mut Packer) {
        p.pack_string(&self.name);
        p.pack_u32(self.flags);
        p.pack_u64(self.modified);
        pack_vector(p, &self.version);
        p.pack_u64(self.local_version);
        p.pack_array(&self.blocks, |p, b| b.pack(p));
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            name: u.unpack_string()?,
            flags: u.unpack_u32()?,
            modified: u.unpack_u64()?,
            version: unpack_vector(u)?,
            local_version: u.unpack_u64()?,
            blocks: u.unpack_array(BlockInfo::unpack)?,
        })
    }

    /// POSIX mode bits (bits 0..11).
    pub fn mode(&self) -> u32 {
        self.flags & file_info_flags::MODE_MASK
    }

    /// Set the POSIX mode bits, leaving the high flag bits untouched.
    pub fn set_mode(&mut self, mode: u32) {
        self.flags = (self.flags & !file_info_flags::MODE_MASK) | (mode & file_info_flags::MODE_MASK);
    }

    /// Whether the entry has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.flags & file_info_flags::DELETED != 0
    }

    /// Set or clear the deleted bit.
    pub fn set_deleted(&mut self, value: bool) {
        set_bit(&mut self.flags, file_info_flags::DELETED, value);
    }

    /// Whether the entry is marked invalid.
    pub fn is_invalid(&self) -> bool {
        self.flags & file_info_flags::INVALID != 0
    }

    /// Set or clear the invalid bit.
    pub fn set_invalid(&mut self, value: bool) {
        set_bit(&mut self.flags, file_info_flags::INVALID, value);
    }

    /// Whether the entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.flags & file_info_flags::DIRECTORY != 0
    }

    /// Set or clear the directory bit.
    pub fn set_directory(&mut self, value: bool) {
        set_bit(&mut self.flags, file_info_flags::DIRECTORY, value);
    }

    /// Whether the entry carries no permission bits.
    pub fn has_no_permissions(&self) -> bool {
        self.flags & file_info_flags::NO_PERMISSIONS != 0
    }

    /// Set or clear the no-permissions bit.
    pub fn set_no_permissions(&mut self, value: bool) {
        set_bit(&mut self.flags, file_info_flags::NO_PERMISSIONS, value);
    }

    /// Whether the entry is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.flags & file_info_flags::SYMLINK != 0
    }

    /// Set or clear the symlink bit.
    pub fn set_symlink(&mut self, value: bool) {
        set_bit(&mut self.flags, file_info_flags::SYMLINK, value);
    }

    /// Whether the entry is a symlink whose target is missing.
    pub fn is_symlink_missing_target(&self) -> bool {
        self.flags & file_info_flags::SYMLINK_MISSING_TARGET != 0
    }

    /// Set or clear the symlink-missing-target bit.
    pub fn set_symlink_missing_target(&mut self, value: bool) {
        set_bit(&mut self.flags, file_info_flags::SYMLINK_MISSING_TARGET, value);
    }
}

fn set_bit(flags: &mut u32, mask: u32, value: bool) {
    if value {
        *flags |= mask;
    } else {
        *flags &= !mask;
    }
}

fn pack_vector(p: &mut Packer, v: &VectorClock) {
    let pairs: Vec<(DeviceId, u64)> = v.iter().map(|(id, &val)| (*id, val)).collect();
    p.pack_array(&pairs, |p, (id, val)| {
        p.pack_u64(u64::from_be_bytes(id[..8].try_into().expect("8 bytes")));
        p.pack_u64(*val);
    });
}

fn unpack_vector(u: &mut Unpacker<'_>) -> Result<VectorClock, XdrError> {
    // Wire `Vector` entries are `(u64 id, u64 value)`; this crate's DeviceID
    // is 32 bytes, so on the wire a vector's "id" is the first 8 bytes of
    // the owning device id, zero-extended back out when read.
    let pairs = u.unpack_array(|u| {
        let id = u.unpack_u64()?;
        let value = u.unpack_u64()?;
        Ok((id, value))
    })?;
    let mut clock = VectorClock::new();
    for (id, value) in pairs {
        let mut full = [0u8; 32];
        full[..8].copy_from_slice(&id.to_be_bytes());
        clock.add(full, value);
    }
    Ok(clock)
}

/// A device as listed inside a `Folder`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The device's identity.
    pub ident: DeviceId,
    /// Highest `local_version` this device has announced for the folder.
    pub max_local_version: u64,
    /// Packed trust/role bits, see `core::flags::device`.
    pub flags: u32,
    /// Free-form per-device options.
    pub options: Options,
}

impl Device {
    fn pack(&self, p: &mut Packer) {
        p.pack_opaque(&self.ident);
        p.pack_u64(self.max_local_version);
        p.pack_u32(self.flags);
        pack_options(p, &self.options);
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, XdrError> {
        let ident_bytes = u.unpack_opaque()?;
        let mut ident = [0u8; 32];
        if ident_bytes.len() == 32 {
            ident.copy_from_slice(&ident_bytes);
        }
        Ok(Self {
            ident,
            max_local_version: u.unpack_u64()?,
            flags: u.unpack_u32()?,
            options: unpack_options(u)?,
        })
    }

    /// Reads the first four bytes of `ident` as a big-endian u32. Preserved
    /// for source fidelity; nothing in dispatch relies on it.
    pub fn short(&self) -> u32 {
        u32::from_be_bytes(self.ident[..4].try_into().expect("4 bytes"))
    }

    /// Whether the device is trusted.
    pub fn is_trusted(&self) -> bool {
        self.flags & device_flags::TRUSTED != 0
    }

    /// Set or clear the trusted bit.
    pub fn set_trusted(&mut self, value: bool) {
        set_bit(&mut self.flags, device_flags::TRUSTED, value);
    }

    /// Whether the device is read-only for shared folders.
    pub fn is_read_only(&self) -> bool {
        self.flags & device_flags::READ_ONLY != 0
    }

    /// Set or clear the read-only bit.
    pub fn set_read_only(&mut self, value: bool) {
        set_bit(&mut self.flags, device_flags::READ_ONLY, value);
    }

    /// Whether the device may introduce other devices.
    pub fn is_introducer(&self) -> bool {
        self.flags & device_flags::INTRODUCER != 0
    }

    /// Set or clear the introducer bit.
    pub fn set_introducer(&mut self, value: bool) {
        set_bit(&mut self.flags, device_flags::INTRODUCER, value);
    }
}

/// A shared folder as listed in a `ClusterConfig`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Folder {
    /// Folder identifier, at most 64 characters.
    pub ident: String,
    /// Devices this folder is shared with (as known to the sender).
    pub devices: Vec<Device>,
    /// Packed folder-level flags.
    pub flags: u32,
    /// Free-form per-folder options.
    pub options: Options,
}

impl Folder {
    fn pack(&self, p: &mut Packer) {
        p.pack_string(&self.ident);
        p.pack_array(&self.devices, |p, d| d.pack(p));
        p.pack_u32(self.flags);
        pack_options(p, &self.options);
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, XdrError> {
        Ok(Self {
            ident: u.unpack_string()?,
            devices: u.unpack_array(Device::unpack)?,
            flags: u.unpack_u32()?,
            options: unpack_options(u)?,
        })
    }
}

/// Response status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    /// Request succeeded.
    NoError = 0,
    /// Unspecified failure (e.g. a storage error).
    Error = 1,
    /// The requested file does not exist.
    NoSuchFile = 2,
    /// The request's arguments were invalid.
    Invalid = 3,
}

impl ResponseCode {
    /// Decode a raw wire value, defaulting unknown values to `Error`.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::NoError,
            2 => Self::NoSuchFile,
            3 => Self::Invalid,
            _ => Self::Error,
        }
    }
}

/// The handshake message: client identity plus every shared folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Sender's human-readable client name.
    pub name: String,
    /// Sender's client version string.
    pub version: String,
    /// Folders shared with the recipient.
    pub folders: Vec<Folder>,
    /// Free-form options.
    pub options: Options,
}

/// A full or incremental index of files in a folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPayload {
    /// Folder the files belong to.
    pub folder: String,
    /// File entries (full snapshot for `Index`, delta for `IndexUpdate`).
    pub files: Vec<FileInfo>,
    /// Packed message-level flags.
    pub flags: u32,
    /// Free-form options.
    pub options: Options,
}

/// A block request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// Folder the file belongs to.
    pub folder: String,
    /// Path of the file within the folder.
    pub name: String,
    /// Byte offset of the requested block.
    pub offset: u64,
    /// Size of the requested block.
    pub size: u32,
    /// Expected SHA-256 of the block, if known.
    pub sha: Vec<u8>,
    /// Packed request flags.
    pub flags: u32,
    /// Free-form options.
    pub options: Options,
}

/// A response to a `Request`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Requested bytes, or empty on failure.
    pub data: Vec<u8>,
    /// Status code.
    pub code: ResponseCode,
}

/// A session close notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Close {
    /// Human-readable reason.
    pub reason: String,
    /// Status code.
    pub code: ResponseCode,
}

/// The wire message kind, used on the frame header (`msg_type`, 0..7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// See [`ClusterConfig`].
    ClusterConfig = 0,
    /// See [`IndexPayload`] (full snapshot).
    Index = 1,
    /// See [`Request`].
    Request = 2,
    /// See [`Response`].
    Response = 3,
    /// Heartbeat probe.
    Ping = 4,
    /// Heartbeat reply.
    Pong = 5,
    /// See [`IndexPayload`] (incremental).
    IndexUpdate = 6,
    /// See [`Close`].
    Close = 7,
}

impl MessageKind {
    /// Decode a raw `msg_type` byte, if it names a known kind.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ClusterConfig),
            1 => Some(Self::Index),
            2 => Some(Self::Request),
            3 => Some(Self::Response),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            6 => Some(Self::IndexUpdate),
            7 => Some(Self::Close),
            _ => None,
        }
    }
}

/// A decoded message body paired with its frame's `msg_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// See [`ClusterConfig`].
    ClusterConfig(u16, ClusterConfig),
    /// Full index snapshot.
    Index(u16, IndexPayload),
    /// See [`Request`].
    Request(u16, Request),
    /// See [`Response`].
    Response(u16, Response),
    /// See [`Ping`][Self::Ping].
    Ping(u16),
    /// Heartbeat reply, echoing the originating Ping's `msg_id`.
    Pong(u16),
    /// Incremental index update.
    IndexUpdate(u16, IndexPayload),
    /// See [`Close`].
    Close(u16, Close),
}

impl Message {
    /// The `msg_id` this message was sent or received with.
    pub fn msg_id(&self) -> u16 {
        match self {
            Message::ClusterConfig(id, _)
            | Message::Index(id, _)
            | Message::Request(id, _)
            | Message::Response(id, _)
            | Message::Ping(id)
            | Message::Pong(id)
            | Message::IndexUpdate(id, _)
            | Message::Close(id, _) => *id,
        }
    }

    /// The wire `msg_type` this message encodes as.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ClusterConfig(..) => MessageKind::ClusterConfig,
            Message::Index(..) => MessageKind::Index,
            Message::Request(..) => MessageKind::Request,
            Message::Response(..) => MessageKind::Response,
            Message::Ping(..) => MessageKind::Ping,
            Message::Pong(..) => MessageKind::Pong,
            Message::IndexUpdate(..) => MessageKind::IndexUpdate,
            Message::Close(..) => MessageKind::Close,
        }
    }

    /// Encode this message's body (everything after the 8-byte frame
    /// header). `Ping`/`Pong` encode to zero bytes.
    pub fn pack_body(&self) -> Vec<u8> {
        let mut p = Packer::new();
        match self {
            Message::ClusterConfig(_, cc) => {
                p.pack_string(&cc.name);
                p.pack_string(&cc.version);
                p.pack_array(&cc.folders, |p, f| f.pack(p));
                pack_options(&mut p, &cc.options);
            }
            Message::Index(_, idx) | Message::IndexUpdate(_, idx) => {
                p.pack_string(&idx.folder);
                p.pack_array(&idx.files, |p, f| f.pack(p));
                p.pack_u32(idx.flags);
                pack_options(&mut p, &idx.options);
            }
            Message::Request(_, r) => {
                p.pack_string(&r.folder);
                p.pack_string(&r.name);
                p.pack_u64(r.offset);
                p.pack_u32(r.size);
                p.pack_opaque(&r.sha);
                p.pack_u32(r.flags);
                pack_options(&mut p, &r.options);
            }
            Message::Response(_, r) => {
                p.pack_opaque(&r.data);
                p.pack_u32(r.code as u32);
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_, c) => {
                p.pack_string(&c.reason);
                p.pack_u32(c.code as u32);
            }
        }
        p.into_bytes()
    }

    /// Decode a message body given its already-decoded `msg_type`/`msg_id`.
    pub fn unpack_body(kind: MessageKind, msg_id: u16, body: &[u8]) -> Result<Self, XdrError> {
        let mut u = Unpacker::new(body);
        Ok(match kind {
            MessageKind::ClusterConfig => Message::ClusterConfig(
                msg_id,
                ClusterConfig {
                    name: u.unpack_string()?,
                    version: u.unpack_string()?,
                    folders: u.unpack_array(Folder::unpack)?,
                    options: unpack_options(&mut u)?,
                },
            ),
            MessageKind::Index | MessageKind::IndexUpdate => {
                let payload = IndexPayload {
                    folder: u.unpack_string()?,
                    files: u.unpack_array(FileInfo::unpack)?,
                    flags: u.unpack_u32()?,
                    options: unpack_options(&mut u)?,
                };
                if kind == MessageKind::Index {
                    Message::Index(msg_id, payload)
                } else {
                    Message::IndexUpdate(msg_id, payload)
                }
            }
            MessageKind::Request => Message::Request(
                msg_id,
                Request {
                    folder: u.unpack_string()?,
                    name: u.unpack_string()?,
                    offset: u.unpack_u64()?,
                    size: u.unpack_u32()?,
                    sha: u.unpack_opaque()?,
                    flags: u.unpack_u32()?,
                    options: unpack_options(&mut u)?,
                },
            ),
            MessageKind::Response => Message::Response(
                msg_id,
                Response {
                    data: u.unpack_opaque()?,
                    code: ResponseCode::from_u32(u.unpack_u32()?),
                },
            ),
            MessageKind::Ping => Message::Ping(msg_id),
            MessageKind::Pong => Message::Pong(msg_id),
            MessageKind::Close => Message::Close(
                msg_id,
                Close {
                    reason: u.unpack_string()?,
                    code: ResponseCode::from_u32(u.unpack_u32()?),
                },
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_bodies_are_empty() {
        assert!(Message::Ping(3).pack_body().is_empty());
        assert!(Message::Pong(3).pack_body().is_empty());
    }

    #[test]
    fn flag_setters_do_not_disturb_mode() {
        let mut fi = FileInfo {
            name: "a".into(),
            flags: 0o644,
            modified: 0,
            version: VectorClock::new(),
            local_version: 0,
            blocks: vec![],
        };
        fi.set_deleted(true);
        assert!(fi.is_deleted());
        assert_eq!(fi.mode(), 0o644);
        fi.set_deleted(false);
        assert!(!fi.is_deleted());
        assert_eq!(fi.mode(), 0o644);
    }
}
