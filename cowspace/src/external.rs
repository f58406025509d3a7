// Copyright 2026 cowspace Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Collaborators the space manager is built on.
//!
//! The filesystem embedding the space manager provides the extent records, the persistence, the device layout and
//! the transaction machinery through these traits.

use std::fmt::Debug;

use cowspace_common::error::{Error, Result};
use futures_core::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    block_group::BlockGroupRef,
    manager::SpaceManager,
    profile::{BlockGroupFlags, ContentClass, RaidProfile},
};

/// A used extent reported by an [`ExtentSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsedExtent {
    /// Start address.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
}

impl UsedExtent {
    /// End address, exclusive.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// One device extent backing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stripe {
    /// Device id.
    pub devid: u64,
    /// Physical offset on the device.
    pub physical: u64,
    /// Length of the device extent.
    pub length: u64,
}

/// Layout of a newly allocated chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Logical start address.
    pub start: u64,
    /// Logical length.
    pub length: u64,
    /// Content type and redundancy flags.
    pub flags: BlockGroupFlags,
    /// Device extents backing the chunk.
    pub stripes: Vec<Stripe>,
}

/// A chunk mapping as known by the device layout, independently of block group records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapping {
    /// Logical start address.
    pub start: u64,
    /// Logical length.
    pub length: u64,
    /// Content type and redundancy flags.
    pub flags: BlockGroupFlags,
}

/// Persisted record of a block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGroupRecord {
    /// Logical start address.
    pub start: u64,
    /// Logical length.
    pub length: u64,
    /// Used bytes.
    pub used: u64,
    /// Content type and redundancy flags.
    pub flags: BlockGroupFlags,
}

/// Long running exclusive operations fenced by the [`TransactionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExclusiveOp {
    /// Redundancy conversion or block group reclaim.
    Balance,
    /// Device removal.
    DeviceRemove,
    /// Device resize.
    Resize,
}

/// Source of used-extent records, read in address order.
pub trait ExtentSource: Send + Sync + Debug + 'static {
    /// Return up to `limit` used extents intersecting `[start, end)`, sorted by start address.
    ///
    /// Callers resume from the end of the last returned extent, so implementations don't need to keep any cursor.
    fn scan_used_extents(&self, start: u64, end: u64, limit: usize) -> BoxFuture<'static, Result<Vec<UsedExtent>>>;
}

/// Persistence of block group records, device extents and free space snapshots.
pub trait PersistentStore: Send + Sync + Debug + 'static {
    /// Load all persisted block group records.
    fn load_block_group_records(&self) -> BoxFuture<'static, Result<Vec<BlockGroupRecord>>>;

    /// Load a persisted free space snapshot of a block group, if any.
    fn load_cached_free_space(&self, start: u64, length: u64) -> BoxFuture<'static, Result<Option<Vec<(u64, u64)>>>>;

    /// Insert the record of a newly created block group.
    fn persist_block_group_record(&self, record: BlockGroupRecord) -> BoxFuture<'static, Result<()>>;

    /// Update the record of an existing block group.
    ///
    /// Fails with [`cowspace_common::error::ErrorKind::NotFound`] if the record has not been inserted yet.
    fn update_block_group_record(&self, record: BlockGroupRecord) -> BoxFuture<'static, Result<()>>;

    /// Persist the device extents backing a block group.
    fn persist_device_extents(&self, start: u64, stripes: Vec<Stripe>) -> BoxFuture<'static, Result<()>>;

    /// Persist the free space snapshot of a fully cached block group.
    fn persist_cached_free_space(&self, start: u64, entries: Vec<(u64, u64)>) -> BoxFuture<'static, Result<()>>;

    /// Remove the record (and the free space snapshot) of a block group.
    fn remove_block_group_record(&self, start: u64, length: u64) -> BoxFuture<'static, Result<()>>;
}

/// Physical device layout.
pub trait DeviceLayout: Send + Sync + Debug + 'static {
    /// Number of writable devices.
    fn rw_devices(&self) -> usize;

    /// Device bytes not yet allocated to any chunk.
    fn unallocated_bytes(&self) -> u64;

    /// Allocate a chunk of at most `max_bytes` logical bytes with the given flags.
    ///
    /// Fails with [`cowspace_common::error::ErrorKind::InsufficientDevices`] if the redundancy profile cannot be
    /// satisfied by the writable devices, or [`cowspace_common::error::ErrorKind::NoSpace`] if the devices are full.
    fn allocate_chunk(&self, flags: BlockGroupFlags, max_bytes: u64) -> BoxFuture<'static, Result<ChunkLayout>>;

    /// All chunk mappings.
    fn chunk_mappings(&self) -> Vec<ChunkMapping>;

    /// Whether the chunk starting at `start` is backed by writable devices only.
    fn is_chunk_writeable(&self, start: u64) -> bool;

    /// Release the chunk mapping and its device extents.
    fn release_chunk(&self, start: u64) -> Result<()>;
}

/// Transaction machinery hooks.
pub trait TransactionContext: Send + Sync + Debug + 'static {
    /// Current transaction generation.
    fn generation(&self) -> u64;

    /// Whether the running transaction has been aborted.
    fn is_aborted(&self) -> bool;

    /// Abort the running transaction.
    fn abort(&self, error: &Error);

    /// Try to start an exclusive operation. Returns `false` if another one is running.
    fn try_start_exclusive_op(&self, op: ExclusiveOp) -> bool;

    /// Finish an exclusive operation started by [`TransactionContext::try_start_exclusive_op`].
    fn finish_exclusive_op(&self, op: ExclusiveOp);

    /// Target profile of an active redundancy conversion for `class`.
    fn conversion_target(&self, class: ContentClass) -> Option<RaidProfile>;
}

/// Relocation of all used extents out of a block group.
pub trait Relocator: Send + Sync + Debug + 'static {
    /// Move every used extent of `group` elsewhere.
    ///
    /// The group is read-only while relocating. On success it is expected to hold no used bytes.
    fn relocate(&self, manager: SpaceManager, group: BlockGroupRef) -> BoxFuture<'static, Result<()>>;
}
