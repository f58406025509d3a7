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

//! Chunk allocation.
//!
//! Phase 1 builds a block group in memory from a freshly allocated chunk. Phase 2 persists its records later, from
//! the commit path, so that persisting never re-enters the metadata update that asked for the chunk.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use cowspace_common::{
    error::{Error, ErrorKind, Result},
    units::mult_perc,
};

use crate::{
    block_group::{super_stripe_exclusions, BlockGroup, BlockGroupRef, CacheState, GroupList},
    external::{BlockGroupRecord, ChunkLayout},
    manager::SpaceManager,
    profile::{ContentClass, SpaceLayout},
    space_info::{Admission, ChunkAllocForce, FlushMode, SpaceInfoState, SpaceReservation},
};

impl SpaceManager {
    /// Whether a class with the given counters needs a new chunk at the given escalation level.
    pub(crate) fn should_alloc_chunk(&self, state: &SpaceInfoState, force: ChunkAllocForce) -> bool {
        let config = &self.inner.config;
        match force {
            ChunkAllocForce::Force => true,
            ChunkAllocForce::Limited
                if state.total.saturating_sub(state.used_bytes())
                    < config
                        .limited_floor
                        .max(mult_perc(state.total, config.limited_percent)) =>
            {
                true
            }
            _ => state.used_bytes() + config.alloc_slack >= mult_perc(state.total, config.alloc_threshold_percent),
        }
    }

    /// Allocate a new chunk for `class` if the class needs one at the `force` level.
    ///
    /// Returns whether this call created a block group. Only one allocation per class is in flight. Latecomers wait
    /// for it and re-check whether an allocation is still needed.
    pub async fn chunk_alloc(&self, class: ContentClass, force: ChunkAllocForce) -> Result<bool> {
        self.check_open()?;
        let si = self.space_info(class).clone();

        if class == ContentClass::System {
            // System chunks are only created while recording another chunk.
            let mut state = si.state();
            state.full = true;
            si.settle_tickets(&mut state);
            return Err(Error::no_space(class, 0, state.total.saturating_sub(state.used_with_may_use())));
        }

        let mut force = force;
        loop {
            let notified = {
                let mut state = si.state();
                force = force.max(state.force_alloc);
                let should = self.should_alloc_chunk(&state, force);
                if state.full {
                    if should {
                        return Err(Error::no_space(
                            class,
                            0,
                            state.total.saturating_sub(state.used_with_may_use()),
                        ));
                    }
                    return Ok(false);
                }
                if !should {
                    return Ok(false);
                }
                if !state.chunk_alloc {
                    state.chunk_alloc = true;
                    None
                } else {
                    // Enabled before the lock is dropped, so the wake-up cannot be missed.
                    let mut notified = Box::pin(si.chunk_alloc_done.notified());
                    notified.as_mut().enable();
                    Some(notified)
                }
            };
            match notified {
                None => break,
                Some(notified) => {
                    tracing::trace!(%class, "[chunk allocator]: wait for in-flight chunk allocation");
                    notified.await;
                    force = ChunkAllocForce::NoForce;
                }
            }
        }

        let now = Instant::now();
        let res = {
            let mut chunk = self.inner.chunk_mutex.lock().await;
            let ratio = self.inner.config.metadata_ratio;
            if ratio > 0 && class == ContentClass::Data && self.inner.config.layout == SpaceLayout::Split {
                chunk.data_chunks_allocated += 1;
                if chunk.data_chunks_allocated % ratio == 0 {
                    self.space_info(ContentClass::Metadata).state().force_alloc = ChunkAllocForce::Force;
                }
            }
            self.do_chunk_alloc(class).await
        };

        {
            let mut state = si.state();
            match &res {
                Ok(_) => state.max_extent_size = 0,
                Err(e) if matches!(e.kind(), ErrorKind::NoSpace | ErrorKind::InsufficientDevices) => state.full = true,
                Err(_) => {}
            }
            state.force_alloc = ChunkAllocForce::NoForce;
            state.chunk_alloc = false;
            si.settle_tickets(&mut state);
        }
        si.chunk_alloc_done.notify_waiters();

        self.inner
            .metrics
            .space_chunk_alloc_duration
            .record(now.elapsed().as_secs_f64());
        match res {
            Ok(group) => {
                self.inner.metrics.space_chunk_alloc.increase(1);
                tracing::debug!(
                    %class,
                    start = group.start(),
                    length = group.length(),
                    profile = %group.profile(),
                    "[chunk allocator]: chunk allocated"
                );
                Ok(true)
            }
            Err(e) => {
                self.inner.metrics.space_chunk_alloc_fail.increase(1);
                tracing::debug!(%class, "[chunk allocator]: chunk allocation failed: {e}");
                Err(e)
            }
        }
    }

    async fn do_chunk_alloc(&self, class: ContentClass) -> Result<BlockGroupRef> {
        let flags = self.alloc_flags(class);
        let system = self.reserve_chunk_space().await?;
        let chunk = self
            .inner
            .layout
            .allocate_chunk(flags, self.inner.config.chunk_size[class.index()])
            .await?;
        let group = self.make_block_group(chunk).await?;
        drop(system);
        Ok(group)
    }

    /// Reserve the system bytes needed to record a new chunk, creating at most one system chunk for it.
    async fn reserve_chunk_space(&self) -> Result<SpaceReservation> {
        let bytes = self.inner.config.nodesize * 8 * (self.inner.layout.rw_devices() as u64 + 2);
        let system = self.space_info(ContentClass::System);

        let left = {
            let state = system.state();
            state.total.saturating_sub(state.used_with_may_use())
        };
        if left < bytes {
            let flags = self.alloc_flags(ContentClass::System);
            let size = self.inner.config.chunk_size[ContentClass::System.index()];
            match self.inner.layout.allocate_chunk(flags, size).await {
                Ok(chunk) => {
                    self.make_block_group(chunk).await?;
                }
                Err(e) => tracing::warn!(bytes, "[chunk allocator]: failed to allocate system chunk: {e}"),
            }
        }

        // Never through `reserve`, which may itself allocate a chunk.
        match system.admit(bytes, FlushMode::NoFlush) {
            Admission::Granted => Ok(SpaceReservation::new(system.clone(), ContentClass::System, bytes)),
            Admission::Refused { available } => Err(Error::no_space(ContentClass::System, bytes, available)),
            Admission::Queued(_) => Err(Error::no_space(ContentClass::System, bytes, 0)),
        }
    }

    /// Build and register the block group of a freshly allocated chunk. Its records are persisted in phase 2.
    pub(crate) async fn make_block_group(&self, chunk: ChunkLayout) -> Result<BlockGroupRef> {
        let class = ContentClass::of(chunk.flags);
        let si = self.space_info(class).clone();
        let config = &self.inner.config;

        let excluded = super_stripe_exclusions(chunk.start, chunk.length, &config.super_mirrors, config.super_stripe_len);
        let group = Arc::new(BlockGroup::new(chunk.start, chunk.length, chunk.flags, si.clone(), excluded));
        {
            let mut state = group.state();
            state.new = true;
            state.cached = CacheState::Finished;
            state.stripes = chunk.stripes;
            group.add_new_free_space(&mut state, chunk.start, chunk.start + chunk.length);
        }

        // Marked new before any other maintenance list may see it.
        self.push_pending(&group);
        if let Err(e) = self.inner.registry.insert(group.clone()) {
            self.unlink_from_lists(&group);
            return Err(e);
        }
        si.attach_group(&mut *si.groups.write().await, &group);
        self.refresh_alloc_factor(class);
        self.inner.metrics.space_block_groups.increase(1);

        tracing::debug!(
            start = group.start(),
            length = group.length(),
            flags = ?group.flags(),
            "[chunk allocator]: block group created"
        );
        Ok(group)
    }

    pub(crate) fn record_of(&self, group: &BlockGroupRef) -> BlockGroupRecord {
        BlockGroupRecord {
            start: group.start(),
            length: group.length(),
            used: group.state().used,
            flags: group.flags(),
        }
    }

    /// Persist the records of the groups created since the last call.
    ///
    /// A group whose record cannot be found yet is queued again, unless the transaction is aborted.
    pub async fn create_pending_block_groups(&self) -> Result<()> {
        let pending = std::mem::take(&mut self.inner.lists.lock().pending);
        let mut requeue = vec![];
        let mut iter = pending.into_iter();

        while let Some(group) = iter.next() {
            if group.state().removed {
                continue;
            }

            let record = self.record_of(&group);
            let stripes = group.state().stripes.clone();
            let res = match self.inner.store.persist_block_group_record(record).await {
                Ok(()) => self.inner.store.persist_device_extents(group.start(), stripes).await,
                Err(e) => Err(e),
            };

            match res {
                Ok(()) => {
                    let unused = {
                        let mut state = group.state();
                        state.new = false;
                        !state.is_used()
                    };
                    {
                        let _lists = self.inner.lists.lock();
                        group.set_list(GroupList::None);
                    }
                    if unused {
                        self.mark_unused(&group);
                    }
                    tracing::debug!(start = group.start(), "[chunk allocator]: block group persisted");
                }
                Err(e) if e.kind() == ErrorKind::NotFound && !self.inner.txn.is_aborted() => {
                    tracing::warn!(start = group.start(), "[chunk allocator]: block group record missing, requeue: {e}");
                    requeue.push(group);
                }
                Err(e) => {
                    let e = if e.kind() == ErrorKind::NotFound {
                        Error::new(ErrorKind::Aborted, "transaction aborted while persisting block groups")
                            .with_context("start", group.start())
                            .with_source(e)
                    } else {
                        self.inner.txn.abort(&e);
                        e
                    };
                    requeue.push(group);
                    requeue.extend(iter);
                    self.inner.lists.lock().pending.extend(requeue);
                    return Err(e);
                }
            }
        }

        if !requeue.is_empty() {
            self.inner.lists.lock().pending.extend(requeue);
        }
        Ok(())
    }

    /// Write back the records of the groups touched in the running transaction.
    pub async fn write_dirty_block_groups(&self) -> Result<()> {
        let dirty = {
            let mut lists = self.inner.lists.lock();
            let dirty = std::mem::take(&mut lists.dirty);
            for group in &dirty {
                group.dirty.store(false, Ordering::Relaxed);
            }
            dirty
        };
        let mut iter = dirty.into_iter();

        while let Some(group) = iter.next() {
            if group.state().removed {
                continue;
            }
            match self.inner.store.update_block_group_record(self.record_of(&group)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound && !self.inner.txn.is_aborted() => {
                    tracing::warn!(start = group.start(), "[space manager]: block group record missing, requeue: {e}");
                    self.mark_dirty(&group);
                    continue;
                }
                Err(e) => {
                    let e = if e.kind() == ErrorKind::NotFound {
                        Error::new(ErrorKind::Aborted, "transaction aborted while writing block groups")
                            .with_context("start", group.start())
                            .with_source(e)
                    } else {
                        self.inner.txn.abort(&e);
                        e
                    };
                    self.mark_dirty(&group);
                    iter.for_each(|g| self.mark_dirty(&g));
                    return Err(e);
                }
            }

            if self.inner.config.space_cache {
                self.persist_free_space_snapshot(&group).await;
            }
        }
        Ok(())
    }

    /// Snapshot the free space of a fully cached group, counting its pinned extents as free.
    async fn persist_free_space_snapshot(&self, group: &BlockGroupRef) {
        let pinned = self
            .inner
            .lists
            .lock()
            .pinned
            .iter()
            .filter(|p| Arc::ptr_eq(&p.group, group))
            .map(|p| p.extent)
            .collect::<Vec<_>>();

        let mut index = {
            let state = group.state();
            if state.cached != CacheState::Finished {
                return;
            }
            state.free_space.clone()
        };
        for extent in pinned {
            // Already unpinned extents are in the index.
            index.insert(extent.start, extent.len);
        }

        let entries = index.iter().collect();
        if let Err(e) = self.inner.store.persist_cached_free_space(group.start(), entries).await {
            tracing::warn!(start = group.start(), "[space manager]: failed to persist free space snapshot: {e}");
        }
    }

    /// Run the block group part of a transaction commit.
    pub async fn commit_transaction(&self) -> Result<()> {
        self.create_pending_block_groups().await?;
        self.write_dirty_block_groups().await?;
        self.unpin_extents();

        let queued = {
            let lists = self.inner.lists.lock();
            !lists.unused.is_empty() || !lists.reclaim.is_empty()
        };
        if queued {
            self.trigger_reclaim();
        }
        tracing::trace!(
            generation = self.inner.txn.generation(),
            "[space manager]: transaction committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cowspace_common::units::{GIB, MIB};

    use super::*;
    use crate::{
        external::TransactionContext,
        profile::RaidProfile,
        test_utils::{MemoryDeviceLayout, MemoryExtentSource, MemoryStore, TestHarness},
    };

    #[test_log::test(tokio::test)]
    async fn test_should_alloc_thresholds() {
        let harness = TestHarness::new(|b| b).await.unwrap();
        let manager = &harness.manager;

        let mut state = SpaceInfoState {
            total: 100 * MIB,
            used: 77 * MIB,
            ..Default::default()
        };
        assert!(!manager.should_alloc_chunk(&state, ChunkAllocForce::NoForce));
        state.used = 78 * MIB;
        // 78 MiB + 2 MiB slack reaches 80%.
        assert!(manager.should_alloc_chunk(&state, ChunkAllocForce::NoForce));
        assert!(manager.should_alloc_chunk(&SpaceInfoState::default(), ChunkAllocForce::Force));

        let state = SpaceInfoState {
            total: 10 * GIB,
            used: 10 * GIB - 100 * MIB,
            ..Default::default()
        };
        // 100 MiB free is below 1% of 10 GiB.
        assert!(manager.should_alloc_chunk(&state, ChunkAllocForce::Limited));
    }

    #[test_log::test(tokio::test)]
    async fn test_chunk_alloc_creates_pending_group() {
        let harness = TestHarness::open(
            MemoryDeviceLayout::new(1, 4 * GIB),
            MemoryStore::new(),
            MemoryExtentSource::new(),
            |b| b,
        )
        .await
        .unwrap();
        let manager = &harness.manager;

        assert!(manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::Force).await.unwrap());
        let data = manager.space_info_stats(ContentClass::Data);
        assert_eq!(data.total, GIB);
        assert!(!data.chunk_alloc);

        // The system chunk recording it was created on the way, and its reservation returned.
        let system = manager.space_info_stats(ContentClass::System);
        assert_eq!(system.total, 32 * MIB);
        assert_eq!(system.may_use, 0);

        let groups = manager.block_groups();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.state().new));
        assert!(harness.store.records().is_empty());

        manager.create_pending_block_groups().await.unwrap();
        assert_eq!(harness.store.records().len(), 2);
        assert!(groups.iter().all(|g| !g.state().new));
        // Both are empty.
        assert_eq!(manager.inner.lists.lock().unused.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_no_force_below_threshold() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;
        assert!(!manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::NoForce).await.unwrap());
        assert_eq!(harness.layout.allocations(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_full_class_after_device_exhaustion() {
        let harness = TestHarness::new(|b| b).await.unwrap();
        let manager = &harness.manager;

        let err = manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::Force).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert!(manager.space_info_stats(ContentClass::Data).full);

        // A full class fails right away without asking the devices again.
        let err = manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::NoForce).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert_eq!(harness.layout.attempts(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_chunk_record_space_never_queues() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;

        // No system chunk can be made, so recording a data chunk is refused right away.
        let err = manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::Force).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        let system = manager.space_info_stats(ContentClass::System);
        assert_eq!(system.tickets, 0);
        assert_eq!(system.may_use, 0);
        assert_eq!(harness.layout.attempts(), 1);
        assert_eq!(manager.space_info_stats(ContentClass::Data).total, 100 * MIB);
    }

    #[test_log::test(tokio::test)]
    async fn test_metadata_ratio_forces_metadata_chunk() {
        let harness = TestHarness::open(
            MemoryDeviceLayout::new(1, 8 * GIB),
            MemoryStore::new(),
            MemoryExtentSource::new(),
            |b| b.with_metadata_ratio(2),
        )
        .await
        .unwrap();
        let manager = &harness.manager;

        manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::Force).await.unwrap();
        assert_eq!(manager.space_info_stats(ContentClass::Metadata).total, 0);
        manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::Force).await.unwrap();

        // The second data chunk escalates the next metadata request.
        assert!(manager.chunk_alloc(ContentClass::Metadata, ChunkAllocForce::NoForce).await.unwrap());
        let metadata = manager.space_info_stats(ContentClass::Metadata);
        assert_eq!(metadata.total, 256 * MIB);
        assert_eq!(manager.alloc_profile(ContentClass::Metadata), RaidProfile::Dup);
    }

    #[test_log::test(tokio::test)]
    async fn test_pending_group_requeued_on_missing_record() {
        let harness = TestHarness::open(
            MemoryDeviceLayout::new(1, 4 * GIB),
            MemoryStore::new(),
            MemoryExtentSource::new(),
            |b| b,
        )
        .await
        .unwrap();
        let manager = &harness.manager;

        manager.chunk_alloc(ContentClass::Data, ChunkAllocForce::Force).await.unwrap();
        harness.store.fail_persist_not_found(true);
        manager.create_pending_block_groups().await.unwrap();
        assert_eq!(manager.inner.lists.lock().pending.len(), 2);

        harness.txn.abort(&Error::new(ErrorKind::External, "test"));
        let err = manager.create_pending_block_groups().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert_eq!(manager.inner.lists.lock().pending.len(), 2);
    }
}
