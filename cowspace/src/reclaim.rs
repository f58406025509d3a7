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

//! Removal of empty block groups and relocation of sparsely used ones.

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use cowspace_common::{
    error::{Error, Result},
    sub_counter,
    units::mult_perc,
};
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
};

use crate::{
    block_group::{BlockGroupRef, GroupList},
    external::ExclusiveOp,
    manager::{take_pinned, Inner, SpaceManager},
    profile::ContentClass,
};

enum Verdict {
    Skip,
    Retry,
    Unused,
    Proceed,
}

impl SpaceManager {
    /// Remove an empty, read-only block group.
    ///
    /// The group is unlinked from the registry, its class and every maintenance list. Its chunk is released unless
    /// the group is frozen, in which case the last [`SpaceManager::unfreeze`] releases it.
    pub async fn remove_block_group(&self, group: &BlockGroupRef) -> Result<()> {
        // A failed caching task leaves nothing behind to wait for.
        let _ = self.wait_block_group_cache_done(group).await;

        {
            let state = group.state();
            if state.removed {
                return Err(Error::busy("block group already removed").with_context("start", group.start()));
            }
            if state.ro == 0 {
                return Err(Error::busy("block group is not read-only").with_context("start", group.start()));
            }
            if state.is_used() {
                return Err(Error::busy("block group is in use")
                    .with_context("start", group.start())
                    .with_context("used", state.used)
                    .with_context("reserved", state.reserved)
                    .with_context("pinned", state.pinned));
            }
        }

        self.inner
            .store
            .remove_block_group_record(group.start(), group.length())
            .await?;
        self.inner.registry.remove(group);

        let si = group.space_info();
        si.detach_group(&mut *si.groups.write().await, group);

        let frozen = {
            let mut state = group.state();
            state.removed = true;
            state.frozen > 0
        };
        self.unlink_from_lists(group);
        if !frozen {
            self.release_chunk(group);
        }

        self.refresh_alloc_factor(ContentClass::of(group.flags()));
        self.inner.metrics.space_block_groups.decrease(1);
        tracing::info!(
            start = group.start(),
            length = group.length(),
            frozen,
            "[reclaim]: block group removed"
        );
        Ok(())
    }

    /// Release the chunk of a removed group and drop its free space.
    pub(crate) fn release_chunk(&self, group: &BlockGroupRef) {
        if let Err(e) = self.inner.layout.release_chunk(group.start()) {
            tracing::warn!(start = group.start(), "[reclaim]: failed to release chunk: {e}");
        }
        group.state().free_space.clear();
        // Released device space may let a full class allocate again.
        for si in self.space_infos() {
            si.state().full = false;
        }
    }

    /// Drop the pinned extents of a group about to be removed. Their bytes turn read-only.
    fn clean_pinned(&self, group: &BlockGroupRef) {
        let extents = take_pinned(&mut self.inner.lists.lock(), group);
        if extents.is_empty() {
            return;
        }
        let si = group.space_info();
        let mut si_state = si.state();
        let mut state = group.state();
        for extent in extents {
            sub_counter!(state.pinned, extent.len, "block_group.pinned");
            sub_counter!(si_state.pinned, extent.len, "space_info.pinned");
            if state.ro > 0 {
                si_state.readonly += extent.len;
            }
        }
    }

    /// Remove the groups queued as unused.
    ///
    /// Returns the number of removed groups. Skips the pass if another reclaim pass is running.
    pub async fn delete_unused_block_groups(&self) -> Result<usize> {
        self.check_open()?;
        let Ok(_guard) = self.inner.reclaim_lock.try_lock() else {
            tracing::debug!("[reclaim]: another pass is running, skip unused pass");
            return Ok(0);
        };

        let mut removed = 0;
        let mut retry = vec![];

        loop {
            let group = {
                let mut lists = self.inner.lists.lock();
                let group = lists.unused.pop_front();
                if let Some(group) = &group {
                    group.set_list(GroupList::None);
                }
                group
            };
            let Some(group) = group else {
                break;
            };

            let si = group.space_info().clone();
            if si.flags().is_mixed() {
                continue;
            }

            {
                let groups = si.groups.write().await;
                let verdict = {
                    let si_state = si.state();
                    let state = group.state();
                    if state.removed || state.discard_pending || state.new {
                        Verdict::Skip
                    } else if state.used > 0 || state.reserved > 0 || state.ro > 0 {
                        Verdict::Skip
                    } else if state.pinned > 0 {
                        // Freed this transaction. Reconsidered once the commit unpins.
                        Verdict::Retry
                    } else if groups.list(group.profile()).len() <= 1 {
                        // Keep the last group of a profile, so the profile stays known.
                        Verdict::Skip
                    } else if si_state.total.saturating_sub(group.length()) < si_state.used_with_may_use() {
                        Verdict::Retry
                    } else {
                        Verdict::Proceed
                    }
                };
                match verdict {
                    Verdict::Skip | Verdict::Unused => continue,
                    Verdict::Retry => {
                        retry.push(group);
                        continue;
                    }
                    Verdict::Proceed => {}
                }
                if let Err(refusal) = self.inc_ro(&group, false) {
                    tracing::debug!(start = group.start(), ?refusal, "[reclaim]: unused group stays read-write");
                    retry.push(group);
                    continue;
                }
            }

            self.clean_pinned(&group);
            match self.remove_block_group(&group).await {
                Ok(()) => {
                    removed += 1;
                    self.inner.metrics.space_remove_unused.increase(1);
                }
                Err(e) => {
                    tracing::warn!(start = group.start(), "[reclaim]: failed to remove unused block group: {e}");
                    self.dec_ro(&group);
                }
            }
        }

        if !retry.is_empty() {
            let mut lists = self.inner.lists.lock();
            for group in retry {
                if group.list() == GroupList::None {
                    group.set_list(GroupList::Unused);
                    lists.unused.push_back(group);
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "[reclaim]: unused pass finished");
        }
        Ok(removed)
    }

    /// Relocate the groups queued as underused, then run the unused pass.
    ///
    /// Returns the number of groups relocated and removed. Skips the pass if another exclusive operation is running.
    pub async fn reclaim_block_groups(&self) -> Result<usize> {
        self.check_open()?;
        if !self.inner.txn.try_start_exclusive_op(ExclusiveOp::Balance) {
            tracing::debug!("[reclaim]: exclusive operation in progress, skip underused pass");
            return Ok(0);
        }

        let now = Instant::now();
        let res = self.relocate_underused().await;
        self.inner.txn.finish_exclusive_op(ExclusiveOp::Balance);

        let unused = self.delete_unused_block_groups().await;
        self.inner
            .metrics
            .space_reclaim_pass_duration
            .record(now.elapsed().as_secs_f64());

        let relocated = res?;
        unused?;
        Ok(relocated)
    }

    async fn relocate_underused(&self) -> Result<usize> {
        let Ok(_guard) = self.inner.reclaim_lock.try_lock() else {
            tracing::debug!("[reclaim]: another pass is running, skip underused pass");
            return Ok(0);
        };

        let mut candidates = {
            let mut lists = self.inner.lists.lock();
            let candidates = std::mem::take(&mut lists.reclaim);
            for group in &candidates {
                group.set_list(GroupList::None);
            }
            candidates
        };
        candidates.sort_by_cached_key(|g| g.state().used);

        let mut relocated = 0;
        for group in candidates {
            let si = group.space_info().clone();
            {
                let _groups = si.groups.write().await;
                let verdict = {
                    let state = group.state();
                    let pct = si.reclaim_threshold();
                    if state.removed || state.reserved > 0 || state.pinned > 0 || state.ro > 0 {
                        Verdict::Skip
                    } else if state.used == 0 {
                        Verdict::Unused
                    } else if pct == 0 || state.used >= mult_perc(group.length(), pct) {
                        Verdict::Skip
                    } else {
                        Verdict::Proceed
                    }
                };
                match verdict {
                    Verdict::Skip | Verdict::Retry => continue,
                    Verdict::Unused => {
                        self.mark_unused(&group);
                        continue;
                    }
                    Verdict::Proceed => {}
                }
                if let Err(refusal) = self.inc_ro(&group, false) {
                    tracing::debug!(start = group.start(), ?refusal, "[reclaim]: underused group stays read-write");
                    continue;
                }
            }

            self.wait_nocow_writers_drain(&group).await;
            self.wait_block_group_reservations(&group).await;

            let used = group.state().used;
            tracing::info!(start = group.start(), used, "[reclaim]: relocating underused block group");

            match self.inner.relocator.relocate(self.clone(), group.clone()).await {
                Ok(()) => {
                    self.inner.metrics.space_relocate.increase(1);
                    let empty = {
                        let state = group.state();
                        state.used == 0 && state.reserved == 0
                    };
                    if !empty {
                        tracing::warn!(start = group.start(), "[reclaim]: block group not empty after relocation");
                        self.dec_ro(&group);
                        continue;
                    }
                    self.clean_pinned(&group);
                    match self.remove_block_group(&group).await {
                        Ok(()) => relocated += 1,
                        Err(e) => {
                            tracing::warn!(start = group.start(), "[reclaim]: failed to remove relocated block group: {e}");
                            self.dec_ro(&group);
                        }
                    }
                }
                Err(e) => {
                    self.inner.metrics.space_relocate_fail.increase(1);
                    tracing::warn!(start = group.start(), "[reclaim]: relocation failed, block group set read-write: {e}");
                    self.dec_ro(&group);
                    self.mark_reclaim(&group);
                }
            }
        }

        Ok(relocated)
    }
}

/// Background runner of the unused and underused passes.
#[derive(Debug)]
pub(crate) struct ReclaimEngine {
    trigger: Arc<Notify>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ReclaimEngine {
    pub fn spawn(manager: &SpaceManager, interval: Duration) -> Self {
        let trigger = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = oneshot::channel();

        let runner = ReclaimRunner {
            inner: Arc::downgrade(&manager.inner),
            trigger: trigger.clone(),
            interval,
            stop_rx,
        };
        let handle = manager.inner.runtime.background().spawn(async move { runner.run().await });

        Self {
            trigger,
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            tracing::warn!("[reclaim engine]: runner exits abnormally: {e}");
        }
    }
}

struct ReclaimRunner {
    inner: Weak<Inner>,
    trigger: Arc<Notify>,
    interval: Duration,
    stop_rx: oneshot::Receiver<()>,
}

impl ReclaimRunner {
    async fn run(mut self) {
        tracing::debug!(interval = ?self.interval, "[reclaim engine]: start");
        loop {
            tokio::select! {
                biased;
                _ = &mut self.stop_rx => {
                    tracing::info!("[reclaim engine]: reclaim engine exits");
                    return;
                }
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            let Some(inner) = self.inner.upgrade() else {
                tracing::info!("[reclaim engine]: space manager dropped, reclaim engine exits");
                return;
            };
            let manager = SpaceManager { inner };

            if let Err(e) = manager.delete_unused_block_groups().await {
                tracing::warn!("[reclaim engine]: unused pass failed: {e}");
            }
            if let Err(e) = manager.reclaim_block_groups().await {
                tracing::warn!("[reclaim engine]: underused pass failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cowspace_common::{
        error::ErrorKind,
        units::{GIB, MIB},
    };

    use super::*;
    use crate::test_utils::TestHarness;

    #[test_log::test(tokio::test)]
    async fn test_unused_pass_keeps_last_group() {
        let harness = TestHarness::new(|b| b).await.unwrap();
        let manager = &harness.manager;
        harness.add_data_group(GIB, 64 * MIB).await.unwrap();
        harness.add_data_group(GIB + 64 * MIB, 64 * MIB).await.unwrap();

        assert_eq!(manager.delete_unused_block_groups().await.unwrap(), 1);
        assert_eq!(manager.block_groups().len(), 1);
        assert_eq!(manager.space_info_stats(ContentClass::Data).total, 64 * MIB);
        assert_eq!(manager.space_info_stats(ContentClass::Data).readonly, 0);
        assert_eq!(harness.layout.released().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_remove_requires_empty_read_only_group() {
        let harness = TestHarness::single_data_group(64 * MIB).await.unwrap();
        let manager = &harness.manager;
        let group = manager.block_groups().remove(0);

        let err = manager.remove_block_group(&group).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        let (g, extent) = manager.find_and_reserve(ContentClass::Data, MIB).await.unwrap();
        manager.set_read_only(&g, true).await.unwrap();
        let err = manager.remove_block_group(&group).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        manager.release(&g, extent, false);
        manager.remove_block_group(&group).await.unwrap();
        assert!(manager.lookup_block_group(GIB).is_none());
        assert!(group.stats().removed);
    }

    #[test_log::test(tokio::test)]
    async fn test_frozen_group_defers_chunk_release() {
        let harness = TestHarness::single_data_group(64 * MIB).await.unwrap();
        let manager = &harness.manager;
        let group = manager.block_groups().remove(0);

        manager.freeze(&group);
        manager.set_read_only(&group, true).await.unwrap();
        manager.remove_block_group(&group).await.unwrap();
        assert!(harness.layout.released().is_empty());
        assert!(group.stats().free_bytes > 0);

        manager.unfreeze(&group);
        assert_eq!(harness.layout.released(), vec![GIB]);
        assert_eq!(group.stats().free_bytes, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_discard_pending_defers_removal() {
        let harness = TestHarness::new(|b| b).await.unwrap();
        let manager = &harness.manager;
        let a = harness.add_data_group(GIB, 64 * MIB).await.unwrap();
        let b = harness.add_data_group(GIB + 64 * MIB, 64 * MIB).await.unwrap();

        manager.mark_discard_pending(&a);
        manager.mark_discard_pending(&b);
        assert_eq!(manager.delete_unused_block_groups().await.unwrap(), 0);
        assert!(manager.lookup_block_group(GIB).is_some());

        manager.complete_discard(&a);
        assert_eq!(manager.delete_unused_block_groups().await.unwrap(), 1);
        assert!(manager.lookup_block_group(GIB).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_pinned_group_removed_after_unpin() {
        let harness = TestHarness::new(|b| b).await.unwrap();
        let manager = &harness.manager;
        let a = harness.add_data_group(GIB, 64 * MIB).await.unwrap();
        harness.add_data_group(GIB + 64 * MIB, 64 * MIB).await.unwrap();

        let (g, extent) = manager.find_and_reserve(ContentClass::Data, 4 * MIB).await.unwrap();
        assert!(Arc::ptr_eq(&g, &a));
        manager.commit_extent(&a, extent);
        manager.release(&a, extent, true);
        assert_eq!(a.stats().pinned, 4 * MIB);

        // The freeing transaction has not committed yet.
        assert_eq!(manager.delete_unused_block_groups().await.unwrap(), 0);
        assert!(!a.stats().removed);
        assert!(harness.layout.released().is_empty());
        assert_eq!(a.list(), GroupList::Unused);

        assert_eq!(manager.unpin_extents(), 1);
        assert_eq!(manager.delete_unused_block_groups().await.unwrap(), 1);
        assert!(a.stats().removed);
        assert_eq!(harness.layout.released(), vec![GIB]);
        let stats = manager.space_info_stats(ContentClass::Data);
        assert_eq!(stats.pinned, 0);
        assert_eq!(stats.readonly, 0);
        assert_eq!(stats.total, 64 * MIB);
    }
}
