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

//! Two-phase reservation: soft-reserve against the class, then attach to a block group.

use std::time::Instant;

use cowspace_common::{
    error::{Error, ErrorKind, Result},
    sub_counter,
    units::{is_aligned, mult_perc},
};

use crate::{
    block_group::{BlockGroupRef, CacheState, Extent},
    caching::cached_up_to,
    manager::{PinnedExtent, SpaceManager},
    profile::{BlockGroupFlags, ContentClass, SizeClass},
    space_info::{Admission, ChunkAllocForce, FlushMode, SpaceInfo, SpaceReservation},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SearchStage {
    /// Groups whose index already holds free space.
    Cached,
    /// Wait for caching groups to expose enough free space.
    WaitProgress,
    /// Wait for caching groups to finish.
    WaitDone,
    /// Accept groups of a mismatched size class.
    IgnoreSizeClass,
}

enum Carve {
    Done(u64),
    Skip { max_free: u64 },
}

impl SpaceManager {
    /// Soft-reserve `bytes` of `class`.
    ///
    /// With [`FlushMode::Flush`], queues a ticket, allocates chunks for the class and waits until the ticket is
    /// granted or the class is exhausted.
    pub async fn reserve(&self, class: ContentClass, bytes: u64, flush: FlushMode) -> Result<SpaceReservation> {
        self.check_open()?;
        let si = self.space_info(class).clone();
        self.inner.metrics.space_reserve.increase(1);

        let mut ticket = match si.admit(bytes, flush) {
            Admission::Granted => return Ok(SpaceReservation::new(si, class, bytes)),
            Admission::Refused { available } => {
                self.inner.metrics.space_reserve_fail.increase(1);
                return Err(Error::no_space(class, bytes, available));
            }
            Admission::Queued(ticket) => ticket,
        };

        self.inner.metrics.space_reserve_wait.increase(1);
        let now = Instant::now();
        tracing::trace!(%class, bytes, "[space manager]: reservation queued");

        loop {
            if ticket.is_granted() || si.state().full {
                break;
            }
            match self.chunk_alloc(class, ChunkAllocForce::Force).await {
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::NoSpace | ErrorKind::InsufficientDevices) => break,
                Err(e) => {
                    self.inner.metrics.space_reserve_fail.increase(1);
                    return Err(e);
                }
            }
        }

        {
            let mut state = si.state();
            si.fail_tickets_if_exhausted(&mut state);
        }
        let res = ticket.wait().await;

        self.inner
            .metrics
            .space_reserve_wait_duration
            .record(now.elapsed().as_secs_f64());

        match res {
            Ok(()) => Ok(SpaceReservation::new(si, class, bytes)),
            Err(e) => {
                self.inner.metrics.space_reserve_fail.increase(1);
                tracing::debug!(%class, bytes, "[space manager]: reservation failed: {e}");
                Err(e)
            }
        }
    }

    /// Allocate an extent of `num_bytes` from a block group, consuming `ram_bytes` of `reservation`.
    ///
    /// `num_bytes` may be smaller than `ram_bytes` (e.g. after compression). The difference returns to the class.
    /// Allocates at most one new chunk before failing with [`ErrorKind::NoSpace`].
    pub async fn allocate(
        &self,
        reservation: &mut SpaceReservation,
        ram_bytes: u64,
        num_bytes: u64,
    ) -> Result<(BlockGroupRef, Extent)> {
        self.check_open()?;
        if num_bytes == 0 || num_bytes > ram_bytes || ram_bytes > reservation.bytes() {
            return Err(Error::new(ErrorKind::InvalidArgument, "allocation does not fit its reservation")
                .with_context("num_bytes", num_bytes)
                .with_context("ram_bytes", ram_bytes)
                .with_context("reserved", reservation.bytes()));
        }
        let sectorsize = self.inner.config.sectorsize;
        if !is_aligned(num_bytes, sectorsize) {
            return Err(Error::new(ErrorKind::InvalidArgument, "allocation is not sector aligned")
                .with_context("num_bytes", num_bytes)
                .with_context("sectorsize", sectorsize));
        }

        let class = reservation.class();
        let si = reservation.space_info().clone();
        let flag = class.flag();

        let mut stage = SearchStage::Cached;
        let mut chunk_allocated = false;

        loop {
            let profile = self.alloc_profile(class);
            let mut max_free = 0;
            let mut pending = vec![];
            let mut not_cached = vec![];

            let found = {
                let groups = si.groups.read().await;
                let mut found = None;
                for group in groups.ordered_from(profile) {
                    if !group.flags().contains(flag) {
                        continue;
                    }
                    match group.cache_state() {
                        CacheState::Error => continue,
                        CacheState::NotCached => {
                            not_cached.push(group.clone());
                            continue;
                        }
                        CacheState::Started => pending.push(group.clone()),
                        CacheState::Finished => {}
                    }
                    let ignore_size_class = stage >= SearchStage::IgnoreSizeClass;
                    match self.carve(&si, group, ram_bytes, num_bytes, ignore_size_class) {
                        Carve::Done(start) => {
                            // Counted under the membership read lock, see `wait_block_group_reservations`.
                            if group.flags().contains(BlockGroupFlags::DATA) {
                                group.reservations.inc();
                            }
                            found = Some((
                                group.clone(),
                                Extent {
                                    start,
                                    len: num_bytes,
                                },
                            ));
                            break;
                        }
                        Carve::Skip { max_free: m } => max_free = max_free.max(m),
                    }
                }
                found
            };

            if let Some((group, extent)) = found {
                reservation.consume(ram_bytes);
                self.inner.metrics.space_allocate.increase(1);
                tracing::trace!(
                    group = group.start(),
                    start = extent.start,
                    len = extent.len,
                    "[space manager]: extent allocated"
                );
                return Ok((group, extent));
            }

            for group in &not_cached {
                self.cache_block_group(group, false).await?;
            }
            pending.extend(not_cached);

            stage = match stage {
                SearchStage::Cached if !pending.is_empty() => {
                    for group in &pending {
                        self.wait_block_group_cache_progress(group, num_bytes).await;
                    }
                    SearchStage::WaitProgress
                }
                SearchStage::WaitProgress if !pending.is_empty() => {
                    for group in &pending {
                        let _ = self.wait_block_group_cache_done(group).await;
                    }
                    SearchStage::WaitDone
                }
                SearchStage::Cached | SearchStage::WaitProgress | SearchStage::WaitDone => {
                    SearchStage::IgnoreSizeClass
                }
                SearchStage::IgnoreSizeClass => {
                    si.state().max_extent_size = max_free;
                    if chunk_allocated {
                        self.inner.metrics.space_allocate_fail.increase(1);
                        return Err(Error::no_space(class, num_bytes, max_free));
                    }
                    chunk_allocated = true;
                    match self.chunk_alloc(class, ChunkAllocForce::Force).await {
                        Ok(_) => SearchStage::Cached,
                        Err(e) if e.kind() == ErrorKind::NoSpace => {
                            self.inner.metrics.space_allocate_fail.increase(1);
                            return Err(Error::no_space(class, num_bytes, max_free));
                        }
                        Err(e) => {
                            self.inner.metrics.space_allocate_fail.increase(1);
                            return Err(e);
                        }
                    }
                }
            };
        }
    }

    /// Take `num` bytes from the group's index and move the accounting from may-use to reserved.
    fn carve(&self, si: &SpaceInfo, group: &BlockGroupRef, ram: u64, num: u64, ignore_size_class: bool) -> Carve {
        let mut si_state = si.state();
        let mut state = group.state();

        if state.ro > 0 || state.removed {
            return Carve::Skip { max_free: 0 };
        }
        if group.uses_size_class()
            && !ignore_size_class
            && state.size_class != SizeClass::None
            && state.size_class != SizeClass::of(num)
        {
            return Carve::Skip { max_free: 0 };
        }

        let hint = state.alloc_hint;
        let Some(start) = state.free_space.take(num, hint) else {
            return Carve::Skip {
                max_free: state.free_space.max_extent(),
            };
        };

        state.alloc_hint = start + num;
        if group.uses_size_class() && state.size_class == SizeClass::None {
            state.size_class = SizeClass::of(num);
        }
        state.reserved += num;
        group.check_invariants(&state);

        si_state.reserved += num;
        sub_counter!(si_state.may_use, ram, "space_info.may_use");
        if num < ram {
            si.settle_tickets(&mut si_state);
        }

        Carve::Done(start)
    }

    /// Reserve and allocate `size` bytes of `class` in one go.
    pub async fn find_and_reserve(&self, class: ContentClass, size: u64) -> Result<(BlockGroupRef, Extent)> {
        let mut reservation = self.reserve(class, size, FlushMode::Flush).await?;
        self.allocate(&mut reservation, size, size).await
    }

    /// Commit an allocated extent: its bytes move from reserved to used.
    pub fn commit_extent(&self, group: &BlockGroupRef, extent: Extent) {
        let si = group.space_info();
        let factor = group.profile().factor();
        {
            let mut si_state = si.state();
            let mut state = group.state();
            sub_counter!(state.reserved, extent.len, "block_group.reserved");
            state.used += extent.len;
            group.check_invariants(&state);

            sub_counter!(si_state.reserved, extent.len, "space_info.reserved");
            si_state.used += extent.len;
            si_state.disk_used += extent.len * factor;
            si.settle_tickets(&mut si_state);
        }
        if group.flags().contains(BlockGroupFlags::DATA) {
            group.reservations.dec();
        }
        self.mark_dirty(group);
        self.inner.metrics.space_commit.increase(1);
    }

    /// Free an extent of `group`.
    ///
    /// An uncommitted extent returns to the free space index right away. A committed one is pinned until the next
    /// [`SpaceManager::unpin_extents`].
    pub fn release(&self, group: &BlockGroupRef, extent: Extent, committed: bool) {
        if committed {
            self.release_committed(group, extent);
            return;
        }

        let si = group.space_info();
        let unused = {
            let mut si_state = si.state();
            let mut state = group.state();
            sub_counter!(state.reserved, extent.len, "block_group.reserved");
            sub_counter!(si_state.reserved, extent.len, "space_info.reserved");
            if state.ro > 0 {
                si_state.readonly += extent.len;
            }
            if !state.free_space.insert(extent.start, extent.len) {
                tracing::warn!(
                    group = group.start(),
                    start = extent.start,
                    len = extent.len,
                    "[space manager]: released extent overlaps free space"
                );
            }
            si.settle_tickets(&mut si_state);
            !state.is_used() && !state.removed
        };
        if group.flags().contains(BlockGroupFlags::DATA) {
            group.reservations.dec();
        }
        if unused {
            self.mark_unused(group);
        }
        self.inner.metrics.space_release.increase(1);
    }

    fn release_committed(&self, group: &BlockGroupRef, extent: Extent) {
        let si = group.space_info();
        let factor = group.profile().factor();

        let (unused, reclaim) = {
            let mut si_state = si.state();
            let mut state = group.state();
            let old = state.used;
            sub_counter!(state.used, extent.len, "block_group.used");
            state.pinned += extent.len;
            let new = state.used;

            sub_counter!(si_state.used, extent.len, "space_info.used");
            si_state.pinned += extent.len;
            sub_counter!(si_state.disk_used, extent.len * factor, "space_info.disk_used");

            let pct = si.reclaim_threshold();
            let thresh = mult_perc(group.length(), pct);
            (new == 0, pct > 0 && old >= thresh && new < thresh)
        };

        self.inner.lists.lock().pinned.push(PinnedExtent {
            group: group.clone(),
            extent,
        });
        self.mark_dirty(group);
        if unused {
            self.mark_unused(group);
        } else if reclaim {
            self.mark_reclaim(group);
        }
        self.inner.metrics.space_release_pinned.increase(1);
    }

    /// Return the extents pinned in the finished transaction to their groups.
    ///
    /// Returns the number of extents unpinned.
    pub fn unpin_extents(&self) -> usize {
        let pinned = std::mem::take(&mut self.inner.lists.lock().pinned);
        let count = pinned.len();

        for PinnedExtent { group, extent } in pinned {
            let si = group.space_info();
            let mut si_state = si.state();
            let mut state = group.state();
            if state.removed {
                continue;
            }
            sub_counter!(state.pinned, extent.len, "block_group.pinned");
            sub_counter!(si_state.pinned, extent.len, "space_info.pinned");
            if state.ro > 0 {
                si_state.readonly += extent.len;
            }
            // The range above the caching cursor is found by the caching scan itself.
            let end = extent.end().min(cached_up_to(&group, &state));
            if end > extent.start {
                group.add_new_free_space(&mut state, extent.start, end);
            }
            si.settle_tickets(&mut si_state);
        }

        self.inner.metrics.space_unpin.increase(count as u64);
        if count > 0 {
            tracing::trace!(count, "[space manager]: extents unpinned");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cowspace_common::units::{GIB, KIB, MIB};

    use super::*;
    use crate::test_utils::TestHarness;

    #[test_log::test(tokio::test)]
    async fn test_trimmed_allocation_returns_difference() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;

        let mut reservation = manager.reserve(ContentClass::Data, 8 * MIB, FlushMode::NoFlush).await.unwrap();
        let (group, extent) = manager.allocate(&mut reservation, 8 * MIB, 2 * MIB).await.unwrap();
        assert_eq!(extent.len, 2 * MIB);
        assert_eq!(reservation.bytes(), 0);

        let stats = manager.space_info_stats(ContentClass::Data);
        assert_eq!(stats.may_use, 0);
        assert_eq!(stats.reserved, 2 * MIB);
        assert_eq!(group.stats().reserved, 2 * MIB);
        assert_eq!(group.stats().reservations, 1);

        manager.commit_extent(&group, extent);
        assert_eq!(group.stats().reservations, 0);
        assert_eq!(manager.space_info_stats(ContentClass::Data).used, 2 * MIB);
    }

    #[test_log::test(tokio::test)]
    async fn test_allocation_larger_than_reservation_is_rejected() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;

        let mut reservation = manager.reserve(ContentClass::Data, MIB, FlushMode::NoFlush).await.unwrap();
        let err = manager.allocate(&mut reservation, 2 * MIB, 2 * MIB).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = manager.allocate(&mut reservation, MIB, 2 * MIB).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test_log::test(tokio::test)]
    async fn test_unaligned_allocation_is_rejected() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;

        let mut reservation = manager.reserve(ContentClass::Data, MIB, FlushMode::NoFlush).await.unwrap();
        let err = manager.allocate(&mut reservation, MIB, 4 * KIB + 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(reservation.bytes(), MIB);

        let (_, extent) = manager.allocate(&mut reservation, MIB, 8 * KIB).await.unwrap();
        assert_eq!(extent.len, 8 * KIB);
    }

    #[test_log::test(tokio::test)]
    async fn test_size_class_steers_allocations() {
        let harness = TestHarness::new(|b| b).await.unwrap();
        let manager = &harness.manager;
        let a = harness.add_data_group(GIB, 64 * MIB).await.unwrap();
        let b = harness.add_data_group(GIB + 64 * MIB, 64 * MIB).await.unwrap();

        // The first small allocation types the first group.
        let (g, _) = manager.find_and_reserve(ContentClass::Data, 64 * 1024).await.unwrap();
        assert!(Arc::ptr_eq(&g, &a));
        assert_eq!(a.stats().size_class, SizeClass::Small);

        // A large allocation skips it.
        let (g, _) = manager.find_and_reserve(ContentClass::Data, 16 * MIB).await.unwrap();
        assert!(Arc::ptr_eq(&g, &b));
        assert_eq!(b.stats().size_class, SizeClass::Large);

        // With every group typed otherwise, a medium allocation still succeeds as a last resort.
        let (g, _) = manager.find_and_reserve(ContentClass::Data, 4 * MIB).await.unwrap();
        assert!(Arc::ptr_eq(&g, &a));
    }

    #[test_log::test(tokio::test)]
    async fn test_release_uncommitted_restores_free_space() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;

        let (group, extent) = manager.find_and_reserve(ContentClass::Data, 10 * MIB).await.unwrap();
        let free = group.stats().free_bytes;
        manager.release(&group, extent, false);

        let stats = group.stats();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.free_bytes, free + 10 * MIB);
        assert_eq!(stats.reservations, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_pinned_until_unpin() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;

        let (group, extent) = manager.find_and_reserve(ContentClass::Data, 10 * MIB).await.unwrap();
        manager.commit_extent(&group, extent);
        let free = group.stats().free_bytes;

        manager.release(&group, extent, true);
        let stats = group.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.pinned, 10 * MIB);
        assert_eq!(stats.free_bytes, free);
        assert_eq!(manager.space_info_stats(ContentClass::Data).pinned, 10 * MIB);

        assert_eq!(manager.unpin_extents(), 1);
        let stats = group.stats();
        assert_eq!(stats.pinned, 0);
        assert_eq!(stats.free_bytes, free + 10 * MIB);
        assert_eq!(manager.space_info_stats(ContentClass::Data).pinned, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_release_crossing_threshold_marks_reclaim() {
        let harness = TestHarness::new(|b| b.with_reclaim_threshold(ContentClass::Data, 50))
            .await
            .unwrap();
        let manager = &harness.manager;
        let group = harness.add_data_group(GIB, 100 * MIB).await.unwrap();

        let (g1, e1) = manager.find_and_reserve(ContentClass::Data, 40 * MIB).await.unwrap();
        let (g2, e2) = manager.find_and_reserve(ContentClass::Data, 20 * MIB).await.unwrap();
        assert!(Arc::ptr_eq(&g1, &group) && Arc::ptr_eq(&g2, &group));
        manager.commit_extent(&group, e1);
        manager.commit_extent(&group, e2);
        // The only group is never removed, but the pass takes it off the unused list.
        assert_eq!(manager.delete_unused_block_groups().await.unwrap(), 0);

        // 60% -> 40% crosses the 50% threshold.
        manager.release(&group, e2, true);
        assert_eq!(manager.inner.lists.lock().reclaim.len(), 1);

        // 40% -> 0% marks it unused instead.
        manager.release(&group, e1, true);
        let lists = manager.inner.lists.lock();
        assert!(lists.reclaim.is_empty());
        assert_eq!(lists.unused.len(), 1);
    }
}
