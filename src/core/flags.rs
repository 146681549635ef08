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

//! Bit masks for the packed `flags: u32` fields carried on the wire by
//! `FileInfo` and `Device`. The historical source exposes these as dynamic
//! boolean properties layered over the integer; this crate instead exposes
//! named predicate/setter methods on the owning types (see `message.rs`)
//! that manipulate these masks directly. The `u32` remains the canonical,
//! wire-visible storage.

/// `FileInfo.flags` bit masks.
pub mod file_info {
    /// POSIX mode bits, 0o7777 mask (bits 0..11).
    pub const MODE_MASK: u32 = 0o7777;
    /// Entry has been deleted.
    pub const DELETED: u32 = 1 << 12;
    /// Entry is invalid (e.g. failed to hash locally).
    pub const INVALID: u32 = 1 << 13;
    /// Entry is a directory.
    pub const DIRECTORY: u32 = 1 << 14;
    /// Entry carries no permission bits (platform has none).
    pub const NO_PERMISSIONS: u32 = 1 << 15;
    /// Entry is a symlink.
    pub const SYMLINK: u32 = 1 << 16;
    /// Entry is a symlink whose target is missing.
    pub const SYMLINK_MISSING_TARGET: u32 = 1 << 17;
    /// Mask of every bit this wire format assigns meaning to.
    pub const ALL: u32 = (1 << 18) - 1;
}

/// `Device.flags` bit masks.
pub mod device {
    /// The device is trusted.
    pub const TRUSTED: u32 = 1 << 0;
    /// The device is read-only for shared folders.
    pub const READ_ONLY: u32 = 1 << 1;
    /// The device may introduce other devices it trusts.
    pub const INTRODUCER: u32 = 1 << 2;
    /// Low byte reserved for share-scoped bits.
    pub const SHARE_BITS: u32 = 0x0000_00ff;
}
