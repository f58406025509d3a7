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

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};

use cowspace_common::{counter::InflightCounter, strict_assert};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{
    caching::CachingControl,
    external::Stripe,
    free_space::FreeSpaceIndex,
    profile::{BlockGroupFlags, RaidProfile, SizeClass},
    space_info::SpaceInfo,
};

/// Shared handle of a block group.
pub type BlockGroupRef = Arc<BlockGroup>;

/// A contiguous range of logical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// Start address.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
}

impl Extent {
    /// End address, exclusive.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Free space caching state of a block group.
///
/// `NotCached -> Started -> {Finished, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    /// The free space index has not been populated.
    NotCached,
    /// A caching task is populating the free space index.
    Started,
    /// The free space index is complete.
    Finished,
    /// Caching failed. The group is excluded from allocation.
    Error,
}

impl CacheState {
    /// Whether caching reached a terminal state.
    pub fn is_done(self) -> bool {
        matches!(self, CacheState::Finished | CacheState::Error)
    }
}

/// The single maintenance list among `new`, `unused` and `reclaim` a group may be queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum GroupList {
    None = 0,
    New = 1,
    Unused = 2,
    Reclaim = 3,
}

impl From<u8> for GroupList {
    fn from(v: u8) -> Self {
        match v {
            1 => GroupList::New,
            2 => GroupList::Unused,
            3 => GroupList::Reclaim,
            _ => GroupList::None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BlockGroupState {
    pub used: u64,
    pub reserved: u64,
    pub pinned: u64,
    pub zone_unusable: u64,
    /// `zone_unusable` parked in the space info's readonly bytes while the group is read-only.
    pub ro_zone_unusable: u64,

    pub ro: u32,
    pub frozen: u32,
    pub swap_extents: u32,

    pub cached: CacheState,
    pub caching_ctl: Option<Arc<CachingControl>>,
    pub free_space: FreeSpaceIndex,
    pub size_class: SizeClass,
    pub alloc_hint: u64,

    /// Created in memory, its record not persisted yet.
    pub new: bool,
    pub removed: bool,
    pub discard_pending: bool,

    pub stripes: Vec<Stripe>,
}

impl BlockGroupState {
    /// Whether any byte of the group is used, reserved or pinned.
    pub fn is_used(&self) -> bool {
        self.used > 0 || self.reserved > 0 || self.pinned > 0
    }
}

/// One allocation region of the logical address space.
pub struct BlockGroup {
    start: u64,
    length: u64,
    flags: BlockGroupFlags,
    space_info: Arc<SpaceInfo>,

    /// Superblock copy ranges, sorted and disjoint.
    excluded: Vec<(u64, u64)>,
    bytes_super: u64,

    state: Mutex<BlockGroupState>,

    pub(crate) nocow_writers: InflightCounter,
    pub(crate) reservations: InflightCounter,

    // Both are only modified with the maintenance lists lock held.
    pub(crate) list: AtomicU8,
    pub(crate) dirty: AtomicBool,
}

impl Debug for BlockGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockGroup")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Drop for BlockGroup {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.reserved > 0 || state.pinned > 0 {
            tracing::warn!(
                start = self.start,
                reserved = state.reserved,
                pinned = state.pinned,
                "[block group]: dropped with outstanding bytes"
            );
        }
    }
}

impl BlockGroup {
    pub(crate) fn new(
        start: u64,
        length: u64,
        flags: BlockGroupFlags,
        space_info: Arc<SpaceInfo>,
        excluded: Vec<(u64, u64)>,
    ) -> Self {
        let bytes_super = excluded.iter().map(|(_, len)| len).sum();
        Self {
            start,
            length,
            flags,
            space_info,
            excluded,
            bytes_super,
            state: Mutex::new(BlockGroupState {
                used: 0,
                reserved: 0,
                pinned: 0,
                zone_unusable: 0,
                ro_zone_unusable: 0,
                ro: 0,
                frozen: 0,
                swap_extents: 0,
                cached: CacheState::NotCached,
                caching_ctl: None,
                free_space: FreeSpaceIndex::new(),
                size_class: SizeClass::None,
                alloc_hint: start,
                new: false,
                removed: false,
                discard_pending: false,
                stripes: vec![],
            }),
            nocow_writers: InflightCounter::new(),
            reservations: InflightCounter::new(),
            list: AtomicU8::new(GroupList::None as u8),
            dirty: AtomicBool::new(false),
        }
    }

    /// Start address.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// End address, exclusive.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Content type and redundancy flags.
    pub fn flags(&self) -> BlockGroupFlags {
        self.flags
    }

    /// Redundancy profile.
    pub fn profile(&self) -> RaidProfile {
        self.flags.profile()
    }

    /// Bytes reserved for superblock copies.
    pub fn bytes_super(&self) -> u64 {
        self.bytes_super
    }

    /// Whether `addr` lies inside the group.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Whether the group is currently read-only.
    pub fn is_read_only(&self) -> bool {
        self.state.lock().ro > 0
    }

    /// Current caching state.
    pub fn cache_state(&self) -> CacheState {
        self.state.lock().cached
    }

    pub(crate) fn space_info(&self) -> &Arc<SpaceInfo> {
        &self.space_info
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BlockGroupState> {
        self.state.lock()
    }

    pub(crate) fn excluded(&self) -> &[(u64, u64)] {
        &self.excluded
    }

    pub(crate) fn list(&self) -> GroupList {
        self.list.load(Ordering::Relaxed).into()
    }

    pub(crate) fn set_list(&self, list: GroupList) {
        self.list.store(list as u8, Ordering::Relaxed);
    }

    /// Whether size classes apply to the group.
    pub(crate) fn uses_size_class(&self) -> bool {
        self.flags.is_data_only()
    }

    /// Insert `[from, to)` minus the excluded superblock ranges into the free space index.
    ///
    /// Returns the bytes actually added.
    pub(crate) fn add_new_free_space(&self, state: &mut BlockGroupState, from: u64, to: u64) -> u64 {
        let mut added = 0;
        let mut cur = from;

        for &(es, el) in &self.excluded {
            if cur >= to {
                break;
            }
            let ee = es + el;
            if ee <= cur {
                continue;
            }
            if es >= to {
                break;
            }
            if es > cur {
                added += self.insert_free(state, cur, es);
            }
            cur = cur.max(ee);
        }
        if cur < to {
            added += self.insert_free(state, cur, to);
        }
        added
    }

    fn insert_free(&self, state: &mut BlockGroupState, from: u64, to: u64) -> u64 {
        if state.free_space.insert(from, to - from) {
            tracing::trace!(start = from, len = to - from, "[block group]: free space added");
            to - from
        } else {
            tracing::warn!(
                group = self.start,
                start = from,
                len = to - from,
                "[block group]: free space overlaps existing entry, skipped"
            );
            0
        }
    }

    /// Whether `[start, start + len)` overlaps any excluded superblock range.
    pub(crate) fn overlaps_excluded(&self, start: u64, len: u64) -> bool {
        let end = start + len;
        self.excluded.iter().any(|&(es, el)| es < end && start < es + el)
    }

    /// Free bytes the group accounts for, which the free space index must match once fully cached.
    pub(crate) fn expected_free(&self, state: &BlockGroupState) -> u64 {
        self.length
            .saturating_sub(state.used + state.pinned + state.reserved + self.bytes_super + state.zone_unusable)
    }

    /// Free bytes not owned by anybody: what moves to readonly when the group turns read-only.
    pub(crate) fn unowned_bytes(&self, state: &BlockGroupState) -> u64 {
        self.length.saturating_sub(
            state.reserved + state.pinned + self.bytes_super + state.zone_unusable + state.used,
        )
    }

    pub(crate) fn check_invariants(&self, state: &BlockGroupState) {
        strict_assert!(
            state.used + state.reserved + state.pinned + self.bytes_super + state.zone_unusable <= self.length,
            "block group {} over-accounted: used {} reserved {} pinned {} super {} zone unusable {} length {}",
            self.start,
            state.used,
            state.reserved,
            state.pinned,
            self.bytes_super,
            state.zone_unusable,
            self.length
        );
    }

    /// Free ranges currently in the free space index, sorted by start address.
    pub fn free_space_entries(&self) -> Vec<Extent> {
        self.state
            .lock()
            .free_space
            .iter()
            .map(|(start, len)| Extent { start, len })
            .collect()
    }

    /// A best-effort snapshot of the group counters.
    pub fn stats(&self) -> BlockGroupStats {
        let state = self.state.lock();
        BlockGroupStats {
            start: self.start,
            length: self.length,
            flags: self.flags.bits(),
            profile: self.profile(),
            used: state.used,
            reserved: state.reserved,
            pinned: state.pinned,
            bytes_super: self.bytes_super,
            zone_unusable: state.zone_unusable,
            ro: state.ro,
            frozen: state.frozen,
            swap_extents: state.swap_extents,
            cache_state: state.cached,
            size_class: state.size_class,
            free_bytes: state.free_space.free_bytes(),
            free_extents: state.free_space.len(),
            nocow_writers: self.nocow_writers.get(),
            reservations: self.reservations.get(),
            removed: state.removed,
        }
    }
}

/// A serializable snapshot of block group counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupStats {
    /// Start address.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// Raw flag bits.
    pub flags: u64,
    /// Redundancy profile.
    pub profile: RaidProfile,
    /// Committed bytes.
    pub used: u64,
    /// Allocated, not yet committed bytes.
    pub reserved: u64,
    /// Bytes freed in the running transaction.
    pub pinned: u64,
    /// Superblock copy bytes.
    pub bytes_super: u64,
    /// Zone unusable bytes.
    pub zone_unusable: u64,
    /// Read-only counter.
    pub ro: u32,
    /// Frozen counter.
    pub frozen: u32,
    /// In-place overwrite extents.
    pub swap_extents: u32,
    /// Caching state.
    pub cache_state: CacheState,
    /// Size class.
    pub size_class: SizeClass,
    /// Bytes in the free space index.
    pub free_bytes: u64,
    /// Entries in the free space index.
    pub free_extents: usize,
    /// In-flight nocow writers.
    pub nocow_writers: usize,
    /// In-flight data reservations.
    pub reservations: usize,
    /// Whether the group has been removed.
    pub removed: bool,
}

/// Superblock copy ranges inside `[start, start + length)`.
///
/// Everything below the primary superblock offset is excluded, and each mirror excludes one stripe.
pub(crate) fn super_stripe_exclusions(start: u64, length: u64, mirrors: &[u64], stripe_len: u64) -> Vec<(u64, u64)> {
    let end = start + length;
    let mut ranges = vec![];

    if let Some(&primary) = mirrors.first() {
        if start < primary {
            ranges.push((start, primary.min(end) - start));
        }
    }
    for &mirror in mirrors {
        let s = mirror.max(start);
        let e = (mirror + stripe_len).min(end);
        if s < e {
            ranges.push((s, e - s));
        }
    }

    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (s, l) in ranges {
        match merged.last_mut() {
            Some((ms, ml)) if *ms + *ml >= s => *ml = (*ml).max(s + l - *ms),
            _ => merged.push((s, l)),
        }
    }
    merged
}
