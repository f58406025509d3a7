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

//! Read-only elevation of block groups for relocation, scrub and device removal.

use std::sync::Arc;

use cowspace_common::{
    error::{Error, Result},
    sub_counter,
};

use crate::{
    block_group::BlockGroupRef,
    manager::SpaceManager,
    profile::{BlockGroupFlags, ContentClass},
    space_info::{ChunkAllocForce, FlushMode},
};

/// Why a group could not be made read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoRefusal {
    /// In-place overwrite extents are pinned to the group.
    SwapActive,
    /// The class cannot give up the group's free bytes.
    NoRoom,
}

impl SpaceManager {
    /// Elevate the read-only counter of `group`.
    ///
    /// The first elevation moves the group's unowned free bytes and its zone unusable bytes to the class's readonly
    /// bytes. Later ones only count.
    pub(crate) fn inc_ro(&self, group: &BlockGroupRef, force: bool) -> std::result::Result<(), RoRefusal> {
        let si = group.space_info();
        let mut si_state = si.state();
        let mut state = group.state();

        if state.swap_extents > 0 {
            return Err(RoRefusal::SwapActive);
        }
        if state.ro > 0 {
            state.ro += 1;
            return Ok(());
        }

        let num = group.unowned_bytes(&state);
        let admitted = force
            || if si.flags().contains(BlockGroupFlags::DATA) {
                si_state.used_with_may_use() + num <= si_state.total
            } else {
                si.can_overcommit(&si_state, num, FlushMode::NoFlush)
            };
        if !admitted {
            return Err(RoRefusal::NoRoom);
        }

        let zone_unusable = state.zone_unusable;
        si_state.readonly += num + zone_unusable;
        sub_counter!(si_state.zone_unusable, zone_unusable, "space_info.zone_unusable");
        state.ro_zone_unusable = zone_unusable;
        state.zone_unusable = 0;
        state.ro = 1;
        si_state.ro_groups.push(Arc::downgrade(group));

        tracing::debug!(start = group.start(), readonly = num, force, "[read only]: block group set read-only");
        Ok(())
    }

    /// Drop one read-only elevation. The last one gives the free bytes back to the class.
    pub(crate) fn dec_ro(&self, group: &BlockGroupRef) {
        let si = group.space_info();
        let mut si_state = si.state();
        let mut state = group.state();

        cowspace_common::strict_assert!(state.ro > 0);
        if state.ro == 0 {
            return;
        }
        state.ro -= 1;
        if state.ro > 0 {
            return;
        }

        let zone_unusable = state.ro_zone_unusable;
        state.zone_unusable = zone_unusable;
        state.ro_zone_unusable = 0;
        si_state.zone_unusable += zone_unusable;
        let num = group.unowned_bytes(&state);
        sub_counter!(si_state.readonly, num + zone_unusable, "space_info.readonly");
        si_state
            .ro_groups
            .retain(|g| g.upgrade().is_some_and(|g| !Arc::ptr_eq(&g, group)));
        si.settle_tickets(&mut si_state);

        tracing::debug!(start = group.start(), "[read only]: block group set read-write");
    }

    /// Make `group` read-only. Idempotent: every successful call needs one [`SpaceManager::clear_read_only`].
    ///
    /// Unless `force` is set, the class must be able to give up the group's free bytes. If it can't, one forced
    /// chunk allocation is attempted before retrying once. Fails with
    /// [`cowspace_common::error::ErrorKind::Busy`] on refusal.
    pub async fn set_read_only(&self, group: &BlockGroupRef, force: bool) -> Result<()> {
        self.check_open()?;
        let mut res = self.inc_ro(group, force);

        if res == Err(RoRefusal::NoRoom) {
            let class = ContentClass::of(group.flags());
            if class != ContentClass::System {
                if let Err(e) = self.chunk_alloc(class, ChunkAllocForce::Force).await {
                    tracing::debug!(start = group.start(), "[read only]: chunk allocation for room failed: {e}");
                }
                res = self.inc_ro(group, force);
            }
        }

        match res {
            Ok(()) => {
                self.inner.metrics.space_set_ro.increase(1);
                Ok(())
            }
            Err(RoRefusal::SwapActive) => {
                Err(Error::busy("block group has active swap extents").with_context("start", group.start()))
            }
            Err(RoRefusal::NoRoom) => Err(Error::busy("no room to make block group read-only")
                .with_context("start", group.start())
                .with_context("unowned", group.unowned_bytes(&group.state()))),
        }
    }

    /// Drop one read-only elevation of `group`.
    pub fn clear_read_only(&self, group: &BlockGroupRef) {
        self.dec_ro(group);
        self.inner.metrics.space_clear_ro.increase(1);
    }

    /// Make `group` read-only, then wait until no nocow writer and no data allocation is attached to it.
    pub async fn set_read_only_and_drain(&self, group: &BlockGroupRef, force: bool) -> Result<()> {
        self.set_read_only(group, force).await?;
        self.wait_nocow_writers_drain(group).await;
        self.wait_block_group_reservations(group).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cowspace_common::{error::ErrorKind, units::MIB};

    use super::*;
    use crate::test_utils::TestHarness;

    #[test_log::test(tokio::test)]
    async fn test_read_only_moves_free_bytes() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;
        let group = manager.block_groups().remove(0);

        let (g, extent) = manager.find_and_reserve(ContentClass::Data, 30 * MIB).await.unwrap();
        manager.commit_extent(&g, extent);

        manager.set_read_only(&group, false).await.unwrap();
        assert_eq!(manager.space_info_stats(ContentClass::Data).readonly, 70 * MIB);
        assert_eq!(manager.space_info_stats(ContentClass::Data).ro_groups, 1);

        // Idempotent.
        manager.set_read_only(&group, false).await.unwrap();
        assert_eq!(group.stats().ro, 2);
        assert_eq!(manager.space_info_stats(ContentClass::Data).readonly, 70 * MIB);

        manager.clear_read_only(&group);
        assert!(group.is_read_only());
        manager.clear_read_only(&group);
        assert!(!group.is_read_only());
        let stats = manager.space_info_stats(ContentClass::Data);
        assert_eq!(stats.readonly, 0);
        assert_eq!(stats.ro_groups, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_read_only_refuses_allocations() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;
        let group = manager.block_groups().remove(0);

        manager.set_read_only(&group, true).await.unwrap();
        assert!(!manager.inc_nocow_writers(&group));
        assert_eq!(
            manager.inc_swap_extents(&group).unwrap_err().kind(),
            ErrorKind::Busy
        );

        // The only group is read-only, and the devices are full.
        let err = manager.reserve(ContentClass::Data, MIB, FlushMode::NoFlush).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test_log::test(tokio::test)]
    async fn test_swap_extents_block_read_only() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = &harness.manager;
        let group = manager.block_groups().remove(0);

        manager.inc_swap_extents(&group).unwrap();
        let err = manager.set_read_only(&group, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        manager.dec_swap_extents(&group);
        manager.set_read_only(&group, true).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_drain_waits_for_nocow_writers() {
        let harness = TestHarness::single_data_group(100 * MIB).await.unwrap();
        let manager = harness.manager.clone();
        let group = manager.block_groups().remove(0);

        assert!(manager.inc_nocow_writers(&group));
        let drain = tokio::spawn({
            let manager = manager.clone();
            let group = group.clone();
            async move { manager.set_read_only_and_drain(&group, false).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());
        assert!(group.is_read_only());

        manager.dec_nocow_writers(&group);
        drain.await.unwrap().unwrap();
    }
}
