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
    collections::VecDeque,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use cowspace_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    runtime::Runtime,
    units::{GIB, KIB, MIB},
};
use itertools::Itertools;
use parking_lot::Mutex;

use crate::{
    block_group::{BlockGroupRef, BlockGroupStats, Extent, GroupList},
    external::{DeviceLayout, ExtentSource, PersistentStore, Relocator, TransactionContext},
    profile::{BlockGroupFlags, ContentClass, RaidProfile, SpaceLayout},
    reclaim::ReclaimEngine,
    reducer::{ProfileReducer, DEFAULT_PROFILE_PRIORITY},
    registry::BlockGroupRegistry,
    space_info::{SpaceInfo, SpaceInfoStats},
};

/// Logical offsets of the superblock copies.
pub const DEFAULT_SUPER_MIRRORS: [u64; 3] = [64 * KIB, 64 * MIB, 256 * GIB];

#[derive(Debug, Clone)]
pub(crate) struct SpaceConfig {
    pub layout: SpaceLayout,
    pub nodesize: u64,
    pub sectorsize: u64,
    pub chunk_size: [u64; 3],
    pub fallback_profile: [RaidProfile; 3],
    pub alloc_threshold_percent: u64,
    pub alloc_slack: u64,
    pub limited_floor: u64,
    pub limited_percent: u64,
    pub metadata_ratio: u64,
    pub reclaim_threshold: [u64; 3],
    pub space_cache: bool,
    pub rescue_ignore_bad_groups: bool,
    pub background_reclaim_interval: Option<Duration>,
    pub caching_batch_size: usize,
    pub caching_wake_bytes: u64,
    pub super_mirrors: Vec<u64>,
    pub super_stripe_len: u64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            layout: SpaceLayout::Split,
            nodesize: 16 * KIB,
            sectorsize: 4 * KIB,
            chunk_size: [GIB, 256 * MIB, 32 * MIB],
            fallback_profile: [RaidProfile::Single, RaidProfile::Dup, RaidProfile::Dup],
            alloc_threshold_percent: 80,
            alloc_slack: 2 * MIB,
            limited_floor: 64 * MIB,
            limited_percent: 1,
            metadata_ratio: 0,
            reclaim_threshold: [0; 3],
            space_cache: true,
            rescue_ignore_bad_groups: false,
            background_reclaim_interval: None,
            caching_batch_size: 512,
            caching_wake_bytes: 2 * MIB,
            super_mirrors: DEFAULT_SUPER_MIRRORS.to_vec(),
            super_stripe_len: 64 * KIB,
        }
    }
}

/// An extent freed in the running transaction.
#[derive(Debug)]
pub(crate) struct PinnedExtent {
    pub group: BlockGroupRef,
    pub extent: Extent,
}

/// Maintenance lists. Never locked while a space info or block group lock is held.
#[derive(Debug, Default)]
pub(crate) struct MaintenanceLists {
    /// Groups created in memory whose records are not persisted yet.
    pub pending: Vec<BlockGroupRef>,
    pub dirty: Vec<BlockGroupRef>,
    pub unused: VecDeque<BlockGroupRef>,
    pub reclaim: Vec<BlockGroupRef>,
    pub pinned: Vec<PinnedExtent>,
    pub caching: Vec<BlockGroupRef>,
}

#[derive(Debug, Default)]
pub(crate) struct ChunkState {
    pub data_chunks_allocated: u64,
}

pub(crate) struct Inner {
    pub config: SpaceConfig,
    pub name: String,

    /// Indexed by [`ContentClass::index`]. Data and metadata share one space info in the mixed layout.
    pub space_infos: [Arc<SpaceInfo>; 3],
    pub registry: BlockGroupRegistry,
    pub lists: Mutex<MaintenanceLists>,

    pub chunk_mutex: tokio::sync::Mutex<ChunkState>,
    pub reclaim_lock: tokio::sync::Mutex<()>,

    pub reducer: ProfileReducer,

    pub extent_source: Arc<dyn ExtentSource>,
    pub store: Arc<dyn PersistentStore>,
    pub layout: Arc<dyn DeviceLayout>,
    pub txn: Arc<dyn TransactionContext>,
    pub relocator: Arc<dyn Relocator>,

    pub metrics: Arc<Metrics>,
    pub runtime: Runtime,

    pub engine: Mutex<Option<ReclaimEngine>>,
    pub closed: AtomicBool,
}

/// The block group space manager of one mounted filesystem.
///
/// Cheap to clone. All clones share the same state.
#[derive(Clone)]
pub struct SpaceManager {
    pub(crate) inner: Arc<Inner>,
}

impl Debug for SpaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceManager")
            .field("name", &self.inner.name)
            .field("layout", &self.inner.config.layout)
            .field("block_groups", &self.inner.registry.len())
            .finish()
    }
}

/// Collaborators and shared components the space manager is built on.
#[derive(Debug)]
pub struct SpaceManagerBuildContext {
    /// Used extent records.
    pub extent_source: Arc<dyn ExtentSource>,
    /// Record persistence.
    pub store: Arc<dyn PersistentStore>,
    /// Device layout.
    pub layout: Arc<dyn DeviceLayout>,
    /// Transaction hooks.
    pub txn: Arc<dyn TransactionContext>,
    /// Extent relocation used by the underused reclaim pass.
    pub relocator: Arc<dyn Relocator>,
    /// Metrics.
    pub metrics: Arc<Metrics>,
}

/// Builder of [`SpaceManager`].
#[derive(Debug)]
pub struct SpaceManagerBuilder {
    name: String,
    config: SpaceConfig,
    priority: Vec<RaidProfile>,
    background_workers: Option<usize>,
}

impl SpaceManagerBuilder {
    /// Create a builder with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: SpaceConfig::default(),
            priority: DEFAULT_PROFILE_PRIORITY.to_vec(),
            background_workers: None,
        }
    }

    /// Set how content classes map to space infos.
    ///
    /// Default: [`SpaceLayout::Split`].
    pub fn with_layout(mut self, layout: SpaceLayout) -> Self {
        self.config.layout = layout;
        self
    }

    /// Set the metadata node size, used to size system reservations for new chunks.
    ///
    /// Default: 16 KiB.
    pub fn with_nodesize(mut self, nodesize: u64) -> Self {
        self.config.nodesize = nodesize;
        self
    }

    /// Set the sector size. Allocation sizes must be aligned to it.
    ///
    /// Default: 4 KiB.
    pub fn with_sectorsize(mut self, sectorsize: u64) -> Self {
        self.config.sectorsize = sectorsize;
        self
    }

    /// Set the maximum logical size of new chunks of a content class.
    ///
    /// Default: data 1 GiB, metadata 256 MiB, system 32 MiB.
    pub fn with_chunk_size(mut self, class: ContentClass, bytes: u64) -> Self {
        self.config.chunk_size[class.index()] = bytes;
        self
    }

    /// Set the redundancy profile of a content class used while no group of the class exists.
    ///
    /// Default: data [`RaidProfile::Single`], metadata and system [`RaidProfile::Dup`].
    pub fn with_fallback_profile(mut self, class: ContentClass, profile: RaidProfile) -> Self {
        self.config.fallback_profile[class.index()] = profile;
        self
    }

    /// Set the profile priority table, highest priority first.
    ///
    /// Default: [`DEFAULT_PROFILE_PRIORITY`].
    pub fn with_profile_priority(mut self, priority: Vec<RaidProfile>) -> Self {
        self.priority = priority;
        self
    }

    /// Set the usage percentage of a class above which a new chunk is allocated, and the slack added to usage.
    ///
    /// Default: 80% and 2 MiB.
    pub fn with_alloc_threshold(mut self, percent: u64, slack: u64) -> Self {
        self.config.alloc_threshold_percent = percent.min(100);
        self.config.alloc_slack = slack;
        self
    }

    /// Set the free space floor of limited chunk allocation: the larger of `floor` and `percent` of the class total.
    ///
    /// Default: 64 MiB and 1%.
    pub fn with_limited_alloc_floor(mut self, floor: u64, percent: u64) -> Self {
        self.config.limited_floor = floor;
        self.config.limited_percent = percent.min(100);
        self
    }

    /// Force a metadata chunk allocation every `ratio` data chunk allocations. 0 disables it.
    ///
    /// Default: 0.
    pub fn with_metadata_ratio(mut self, ratio: u64) -> Self {
        self.config.metadata_ratio = ratio;
        self
    }

    /// Set the underused reclaim threshold of a class, in percent of a group's length. 0 disables it.
    ///
    /// Default: 0.
    pub fn with_reclaim_threshold(mut self, class: ContentClass, percent: u64) -> Self {
        self.config.reclaim_threshold[class.index()] = percent.min(100);
        self
    }

    /// Load and save free space snapshots.
    ///
    /// Default: `true`.
    pub fn with_space_cache(mut self, enable: bool) -> Self {
        self.config.space_cache = enable;
        self
    }

    /// On mount failure, create fully used read-only groups from the chunk mappings instead of failing.
    ///
    /// Default: `false`.
    pub fn with_rescue_ignore_bad_groups(mut self, enable: bool) -> Self {
        self.config.rescue_ignore_bad_groups = enable;
        self
    }

    /// Run the unused and underused passes in the background at the given interval.
    ///
    /// Default: `None`, passes only run when called explicitly.
    pub fn with_background_reclaim_interval(mut self, interval: Duration) -> Self {
        self.config.background_reclaim_interval = Some(interval);
        self
    }

    /// Set the number of used extent records read per caching batch.
    ///
    /// Default: 512.
    pub fn with_caching_batch_size(mut self, batch_size: usize) -> Self {
        self.config.caching_batch_size = batch_size;
        self
    }

    /// Set how many newly found free bytes wake caching waiters.
    ///
    /// Default: 2 MiB.
    pub fn with_caching_wake_bytes(mut self, bytes: u64) -> Self {
        self.config.caching_wake_bytes = bytes;
        self
    }

    /// Set the logical offsets of superblock copies. The first one is the primary superblock.
    ///
    /// Default: [`DEFAULT_SUPER_MIRRORS`].
    pub fn with_super_mirrors(mut self, mirrors: Vec<u64>) -> Self {
        self.config.super_mirrors = mirrors;
        self
    }

    /// Run caching and reclaim on a dedicated runtime with `worker_threads` threads.
    ///
    /// Default: the runtime calling [`SpaceManagerBuilder::build`].
    pub fn with_background_runtime(mut self, worker_threads: usize) -> Self {
        self.background_workers = Some(worker_threads);
        self
    }

    /// Build the space manager and read the persisted block groups.
    pub async fn build(self, ctx: SpaceManagerBuildContext) -> Result<SpaceManager> {
        let config = self.config;

        if !config.nodesize.is_power_of_two() || !config.sectorsize.is_power_of_two() {
            return Err(Error::new(ErrorKind::Config, "node size and sector size must be powers of two")
                .with_context("nodesize", config.nodesize)
                .with_context("sectorsize", config.sectorsize));
        }
        if config.chunk_size.iter().any(|&s| s == 0) || config.caching_batch_size == 0 {
            return Err(Error::new(
                ErrorKind::Config,
                "chunk sizes and caching batch size must be positive",
            ));
        }

        let runtime = match self.background_workers {
            Some(workers) => Runtime::with_background_workers(workers)?,
            None => Runtime::current(),
        };

        let space_info = |class: ContentClass| {
            Arc::new(SpaceInfo::new(
                config.layout.space_flags(class),
                ctx.layout.clone(),
                config.reclaim_threshold[class.index()],
            ))
        };
        let data = space_info(ContentClass::Data);
        let metadata = match config.layout {
            SpaceLayout::Split => space_info(ContentClass::Metadata),
            SpaceLayout::Mixed => data.clone(),
        };
        let system = space_info(ContentClass::System);

        let inner = Inner {
            name: self.name,
            space_infos: [data, metadata, system],
            registry: BlockGroupRegistry::new(),
            lists: Mutex::new(MaintenanceLists::default()),
            chunk_mutex: tokio::sync::Mutex::new(ChunkState::default()),
            reclaim_lock: tokio::sync::Mutex::new(()),
            reducer: ProfileReducer::new(self.priority),
            extent_source: ctx.extent_source,
            store: ctx.store,
            layout: ctx.layout,
            txn: ctx.txn,
            relocator: ctx.relocator,
            metrics: ctx.metrics,
            runtime,
            engine: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        };
        let manager = SpaceManager { inner: Arc::new(inner) };

        manager.read_block_groups().await?;
        for class in ContentClass::ALL {
            manager.refresh_alloc_factor(class);
        }

        if let Some(interval) = manager.inner.config.background_reclaim_interval {
            let engine = ReclaimEngine::spawn(&manager, interval);
            *manager.inner.engine.lock() = Some(engine);
        }

        tracing::info!(
            name = manager.inner.name,
            block_groups = manager.inner.registry.len(),
            "[space manager]: built"
        );

        Ok(manager)
    }
}

impl SpaceManager {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Closed, "space manager is closed"));
        }
        Ok(())
    }

    pub(crate) fn space_info(&self, class: ContentClass) -> &Arc<SpaceInfo> {
        &self.inner.space_infos[class.index()]
    }

    /// Distinct space infos.
    pub(crate) fn space_infos(&self) -> Vec<Arc<SpaceInfo>> {
        self.inner
            .space_infos
            .iter()
            .unique_by(|si| Arc::as_ptr(si))
            .cloned()
            .collect()
    }

    /// The redundancy profile new chunks of `class` are allocated with.
    pub fn alloc_profile(&self, class: ContentClass) -> RaidProfile {
        let avail = self.space_info(class).state().avail_profiles;
        let allowed = if avail.is_empty() {
            self.inner.config.fallback_profile[class.index()].into()
        } else {
            avail
        };
        self.inner.reducer.reduce(
            allowed,
            self.inner.layout.rw_devices(),
            self.inner.txn.conversion_target(class),
        )
    }

    pub(crate) fn alloc_flags(&self, class: ContentClass) -> BlockGroupFlags {
        self.inner
            .config
            .layout
            .space_flags(class)
            .with_profile(self.alloc_profile(class))
    }

    pub(crate) fn refresh_alloc_factor(&self, class: ContentClass) {
        self.space_info(class)
            .set_alloc_factor(self.alloc_profile(class).factor());
    }

    pub(crate) fn mark_dirty(&self, group: &BlockGroupRef) {
        let mut lists = self.inner.lists.lock();
        if !group.dirty.swap(true, Ordering::Relaxed) {
            lists.dirty.push(group.clone());
        }
    }

    /// Queue an empty group for the unused pass.
    pub(crate) fn mark_unused(&self, group: &BlockGroupRef) {
        let mut lists = self.inner.lists.lock();
        match group.list() {
            GroupList::None => {}
            GroupList::Reclaim => lists.reclaim.retain(|g| !Arc::ptr_eq(g, group)),
            // Phase 2 checks new groups itself.
            GroupList::New | GroupList::Unused => return,
        }
        group.set_list(GroupList::Unused);
        lists.unused.push_back(group.clone());
        tracing::trace!(start = group.start(), "[space manager]: block group marked unused");
    }

    /// Queue a sparsely used group for the underused pass.
    pub(crate) fn mark_reclaim(&self, group: &BlockGroupRef) {
        let mut lists = self.inner.lists.lock();
        if group.list() == GroupList::None {
            group.set_list(GroupList::Reclaim);
            lists.reclaim.push(group.clone());
            tracing::trace!(start = group.start(), "[space manager]: block group marked for reclaim");
        }
    }

    pub(crate) fn push_pending(&self, group: &BlockGroupRef) {
        let mut lists = self.inner.lists.lock();
        group.set_list(GroupList::New);
        lists.pending.push(group.clone());
    }

    /// Drop the group from every maintenance list. Returns its pinned extents.
    pub(crate) fn unlink_from_lists(&self, group: &BlockGroupRef) -> Vec<Extent> {
        let mut lists = self.inner.lists.lock();
        let not_it = |g: &BlockGroupRef| !Arc::ptr_eq(g, group);
        lists.pending.retain(not_it);
        lists.dirty.retain(not_it);
        lists.unused.retain(not_it);
        lists.reclaim.retain(not_it);
        group.set_list(GroupList::None);
        group.dirty.store(false, Ordering::Relaxed);
        take_pinned(&mut lists, group)
    }

    /// Trigger the background reclaim engine, if running.
    pub fn trigger_reclaim(&self) {
        if let Some(engine) = self.inner.engine.lock().as_ref() {
            engine.trigger();
        }
    }

    /// Set the underused reclaim threshold of a class at runtime.
    pub fn set_reclaim_threshold(&self, class: ContentClass, percent: u64) {
        self.space_info(class).set_reclaim_threshold(percent);
    }

    /// Register a writer bypassing copy-on-write. Returns `false` if the group is read-only.
    pub fn inc_nocow_writers(&self, group: &BlockGroupRef) -> bool {
        let state = group.state();
        if state.ro > 0 {
            return false;
        }
        group.nocow_writers.inc();
        true
    }

    /// Unregister a nocow writer.
    pub fn dec_nocow_writers(&self, group: &BlockGroupRef) {
        group.nocow_writers.dec();
    }

    /// Wait until the group has no nocow writer.
    pub async fn wait_nocow_writers_drain(&self, group: &BlockGroupRef) {
        group.nocow_writers.wait_zero().await;
    }

    /// Wait until all data allocations attached to the group have been committed or released.
    pub async fn wait_block_group_reservations(&self, group: &BlockGroupRef) {
        if !group.flags().contains(BlockGroupFlags::DATA) {
            return;
        }
        // Allocations bump the counter under the membership read lock. Taking the write lock once flushes them.
        drop(group.space_info().groups.write().await);
        group.reservations.wait_zero().await;
    }

    /// Pin an in-place overwrite extent to the group. Fails with [`ErrorKind::Busy`] if the group is read-only.
    pub fn inc_swap_extents(&self, group: &BlockGroupRef) -> Result<()> {
        let mut state = group.state();
        if state.ro > 0 {
            return Err(Error::busy("block group is read-only").with_context("start", group.start()));
        }
        state.swap_extents += 1;
        Ok(())
    }

    /// Unpin an in-place overwrite extent.
    pub fn dec_swap_extents(&self, group: &BlockGroupRef) {
        let mut state = group.state();
        cowspace_common::strict_assert!(state.swap_extents > 0);
        state.swap_extents = state.swap_extents.saturating_sub(1);
    }

    /// Keep the group's chunk mapping alive across a logical removal.
    pub fn freeze(&self, group: &BlockGroupRef) {
        group.state().frozen += 1;
    }

    /// Drop a freeze. The last one releases the chunk of a removed group.
    pub fn unfreeze(&self, group: &BlockGroupRef) {
        let release = {
            let mut state = group.state();
            cowspace_common::strict_assert!(state.frozen > 0);
            state.frozen = state.frozen.saturating_sub(1);
            state.frozen == 0 && state.removed
        };
        if release {
            self.release_chunk(group);
        }
    }

    /// Mark the group's free space as not yet discarded. The unused pass skips it until discarded.
    pub fn mark_discard_pending(&self, group: &BlockGroupRef) {
        group.state().discard_pending = true;
    }

    /// Mark the group's free space as discarded, queueing it for removal if it is empty.
    pub fn complete_discard(&self, group: &BlockGroupRef) {
        let unused = {
            let mut state = group.state();
            state.discard_pending = false;
            !state.is_used() && !state.removed
        };
        if unused {
            self.mark_unused(group);
        }
    }

    /// The group containing `addr`.
    pub fn lookup_block_group(&self, addr: u64) -> Option<BlockGroupRef> {
        self.inner.registry.lookup(addr)
    }

    /// The group containing `addr`, or the first one after it.
    pub fn first_block_group_at_or_after(&self, addr: u64) -> Option<BlockGroupRef> {
        self.inner.registry.first_at_or_after(addr)
    }

    /// The group following `group` in address order.
    pub fn next_block_group(&self, group: &BlockGroupRef) -> Option<BlockGroupRef> {
        self.inner.registry.next(group)
    }

    /// All registered groups in address order.
    pub fn block_groups(&self) -> Vec<BlockGroupRef> {
        self.inner.registry.groups()
    }

    /// Counters of the group containing `addr`.
    pub fn block_group_stats(&self, addr: u64) -> Option<BlockGroupStats> {
        self.lookup_block_group(addr).map(|g| g.stats())
    }

    /// Counters of the space info serving `class`.
    pub fn space_info_stats(&self, class: ContentClass) -> SpaceInfoStats {
        self.space_info(class).stats()
    }

    /// Counters of every distinct space info.
    pub fn all_space_info_stats(&self) -> Vec<SpaceInfoStats> {
        self.space_infos().iter().map(|si| si.stats()).collect()
    }

    /// Stop background work and unlink every block group.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let engine = self.inner.engine.lock().take();
        if let Some(engine) = engine {
            engine.stop().await;
        }

        let caching = self.inner.lists.lock().caching.clone();
        for group in caching {
            let _ = self.wait_block_group_cache_done(&group).await;
        }

        for si in self.space_infos() {
            let stats = si.stats();
            if stats.reserved > 0 || stats.may_use > 0 {
                tracing::warn!(
                    class = si.name(),
                    reserved = stats.reserved,
                    may_use = stats.may_use,
                    "[space manager]: closed with outstanding reservations"
                );
            }
            si.groups.write().await.clear();
        }

        let groups = self.inner.registry.clear();
        *self.inner.lists.lock() = MaintenanceLists::default();
        self.inner.metrics.space_block_groups.absolute(0);

        tracing::info!(
            name = self.inner.name,
            block_groups = groups.len(),
            "[space manager]: closed"
        );
        Ok(())
    }
}

pub(crate) fn take_pinned(lists: &mut MaintenanceLists, group: &BlockGroupRef) -> Vec<Extent> {
    let mut taken = vec![];
    lists.pinned.retain(|p| {
        if Arc::ptr_eq(&p.group, group) {
            taken.push(p.extent);
            false
        } else {
            true
        }
    });
    taken
}
