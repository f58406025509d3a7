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

use std::sync::Arc;

use cowspace_common::error::{Error, ErrorKind, Result};
use itertools::Itertools;

use crate::{
    block_group::{super_stripe_exclusions, BlockGroup, BlockGroupRef, CacheState},
    external::{BlockGroupRecord, ChunkMapping},
    manager::SpaceManager,
    profile::ContentClass,
};

impl SpaceManager {
    /// Rebuild the block groups from their persisted records and validate them against the chunk mappings.
    pub(crate) async fn read_block_groups(&self) -> Result<()> {
        let res = match self.load_block_groups().await {
            Ok(()) => self.validate_chunk_mappings(),
            Err(e) => Err(e),
        };

        match res {
            Ok(()) => {
                tracing::info!(
                    block_groups = self.inner.registry.len(),
                    "[mount]: block groups loaded"
                );
                Ok(())
            }
            Err(e) if self.inner.config.rescue_ignore_bad_groups => {
                tracing::error!("[mount]: failed to load block groups, fill dummy block groups: {e}");
                self.fill_dummy_block_groups().await
            }
            Err(e) => {
                tracing::error!("[mount]: failed to load block groups: {e}");
                Err(e)
            }
        }
    }

    async fn load_block_groups(&self) -> Result<()> {
        let records = self
            .inner
            .store
            .load_block_group_records()
            .await?
            .into_iter()
            .sorted_by_key(|r| r.start)
            .collect_vec();

        for record in records {
            self.load_block_group(record).await?;
        }
        Ok(())
    }

    async fn load_block_group(&self, record: BlockGroupRecord) -> Result<()> {
        let class = ContentClass::of(record.flags);
        let si = self.space_info(class).clone();
        let config = &self.inner.config;

        let excluded = super_stripe_exclusions(record.start, record.length, &config.super_mirrors, config.super_stripe_len);
        let group = Arc::new(BlockGroup::new(record.start, record.length, record.flags, si.clone(), excluded));

        if record.used + group.bytes_super() > record.length {
            return Err(Error::inconsistent("block group used bytes exceed its length")
                .with_context("start", record.start)
                .with_context("length", record.length)
                .with_context("used", record.used)
                .with_context("bytes_super", group.bytes_super()));
        }

        {
            let mut state = group.state();
            state.used = record.used;
            if record.used + group.bytes_super() == record.length {
                state.cached = CacheState::Finished;
            } else if record.used == 0 {
                state.cached = CacheState::Finished;
                group.add_new_free_space(&mut state, record.start, record.start + record.length);
            }
        }

        self.inner.registry.insert(group.clone())?;
        si.attach_group(&mut *si.groups.write().await, &group);
        self.inner.metrics.space_block_groups.increase(1);

        if !self.inner.layout.is_chunk_writeable(group.start()) {
            if let Err(refusal) = self.inc_ro(&group, true) {
                tracing::warn!(
                    start = group.start(),
                    ?refusal,
                    "[mount]: failed to make block group on unwriteable chunk read-only"
                );
            }
        } else if record.used == 0 {
            self.mark_unused(&group);
        }

        tracing::debug!(
            start = group.start(),
            length = group.length(),
            used = record.used,
            cache_state = ?group.cache_state(),
            "[mount]: block group loaded"
        );
        Ok(())
    }

    /// Every chunk mapping has a group and every group a chunk mapping, with the same range and type.
    fn validate_chunk_mappings(&self) -> Result<()> {
        let mappings = self.inner.layout.chunk_mappings();

        for mapping in &mappings {
            let group = self.inner.registry.get(mapping.start);
            match group {
                Some(group) if matches_mapping(&group, mapping) => {}
                Some(group) => {
                    return Err(Error::inconsistent("chunk mapping mismatches its block group")
                        .with_context("start", mapping.start)
                        .with_context("mapping_length", mapping.length)
                        .with_context("mapping_flags", format!("{:?}", mapping.flags))
                        .with_context("group_length", group.length())
                        .with_context("group_flags", format!("{:?}", group.flags())));
                }
                None => {
                    return Err(Error::inconsistent("chunk mapping has no block group")
                        .with_context("start", mapping.start)
                        .with_context("length", mapping.length));
                }
            }
        }

        for group in self.inner.registry.groups() {
            if !mappings.iter().any(|m| m.start == group.start()) {
                return Err(Error::inconsistent("block group has no chunk mapping")
                    .with_context("start", group.start())
                    .with_context("length", group.length()));
            }
        }
        Ok(())
    }

    /// Make every chunk mapping without a group a fully used, read-only group, so the filesystem can continue
    /// read-only.
    async fn fill_dummy_block_groups(&self) -> Result<()> {
        let mut filled = 0;
        for mapping in self.inner.layout.chunk_mappings() {
            if self.inner.registry.get(mapping.start).is_some() {
                continue;
            }

            let class = ContentClass::of(mapping.flags);
            let si = self.space_info(class).clone();
            let group = Arc::new(BlockGroup::new(mapping.start, mapping.length, mapping.flags, si.clone(), vec![]));
            {
                let mut state = group.state();
                state.used = mapping.length;
                state.cached = CacheState::Finished;
            }

            if let Err(e) = self.inner.registry.insert(group.clone()) {
                if e.kind() == ErrorKind::AlreadyExists {
                    continue;
                }
                return Err(e);
            }
            si.attach_group(&mut *si.groups.write().await, &group);
            if let Err(refusal) = self.inc_ro(&group, true) {
                tracing::warn!(start = group.start(), ?refusal, "[mount]: failed to make dummy block group read-only");
            }
            self.inner.metrics.space_block_groups.increase(1);
            filled += 1;
        }

        tracing::warn!(filled, "[mount]: dummy block groups filled, space is read-only");
        Ok(())
    }
}

fn matches_mapping(group: &BlockGroupRef, mapping: &ChunkMapping) -> bool {
    group.length() == mapping.length && group.flags().type_bits() == mapping.flags.type_bits()
}

#[cfg(test)]
mod tests {
    use cowspace_common::units::{GIB, MIB};

    use super::*;
    use crate::{
        profile::BlockGroupFlags,
        test_utils::{MemoryDeviceLayout, MemoryExtentSource, MemoryStore, TestHarness},
    };

    fn record(start: u64, length: u64, used: u64, flags: BlockGroupFlags) -> BlockGroupRecord {
        BlockGroupRecord {
            start,
            length,
            used,
            flags,
        }
    }

    fn seeded(records: &[BlockGroupRecord]) -> (MemoryDeviceLayout, MemoryStore) {
        let layout = MemoryDeviceLayout::new(1, 0);
        let store = MemoryStore::new();
        for r in records {
            layout.insert_chunk(r.start, r.length, r.flags);
            store.insert_record(*r);
        }
        (layout, store)
    }

    #[test_log::test(tokio::test)]
    async fn test_mount_sets_cache_state() {
        let (layout, store) = seeded(&[
            record(GIB, 64 * MIB, 0, BlockGroupFlags::DATA),
            record(GIB + 64 * MIB, 64 * MIB, 64 * MIB, BlockGroupFlags::DATA),
            record(GIB + 128 * MIB, 64 * MIB, 10 * MIB, BlockGroupFlags::DATA),
        ]);
        let harness = TestHarness::open(layout, store, MemoryExtentSource::new(), |b| b)
            .await
            .unwrap();
        let manager = &harness.manager;

        let empty = manager.lookup_block_group(GIB).unwrap();
        assert_eq!(empty.cache_state(), CacheState::Finished);
        assert_eq!(empty.stats().free_bytes, 64 * MIB);

        let full = manager.lookup_block_group(GIB + 64 * MIB).unwrap();
        assert_eq!(full.cache_state(), CacheState::Finished);
        assert_eq!(full.stats().free_bytes, 0);

        let partial = manager.lookup_block_group(GIB + 128 * MIB).unwrap();
        assert_eq!(partial.cache_state(), CacheState::NotCached);

        let stats = manager.space_info_stats(ContentClass::Data);
        assert_eq!(stats.total, 192 * MIB);
        assert_eq!(stats.used, 74 * MIB);
        assert_eq!(manager.inner.lists.lock().unused.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_mount_forces_read_only_on_unwriteable_chunk() {
        let (layout, store) = seeded(&[record(GIB, 64 * MIB, 4 * MIB, BlockGroupFlags::DATA)]);
        layout.set_chunk_readonly(GIB);
        let harness = TestHarness::open(layout, store, MemoryExtentSource::new(), |b| b)
            .await
            .unwrap();

        let group = harness.manager.lookup_block_group(GIB).unwrap();
        assert!(group.is_read_only());
        assert_eq!(harness.manager.space_info_stats(ContentClass::Data).readonly, 60 * MIB);
    }

    #[test_log::test(tokio::test)]
    async fn test_mount_detects_mismatched_mappings() {
        let (layout, store) = seeded(&[record(GIB, 64 * MIB, 0, BlockGroupFlags::DATA)]);
        layout.insert_chunk(2 * GIB, 64 * MIB, BlockGroupFlags::METADATA);
        let err = TestHarness::open(layout, store, MemoryExtentSource::new(), |b| b)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InconsistentMetadata);

        let (layout, store) = seeded(&[record(GIB, 64 * MIB, 0, BlockGroupFlags::DATA)]);
        store.insert_record(record(2 * GIB, 64 * MIB, 0, BlockGroupFlags::DATA));
        let err = TestHarness::open(layout, store, MemoryExtentSource::new(), |b| b)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InconsistentMetadata);

        let (layout, store) = seeded(&[record(GIB, 64 * MIB, 0, BlockGroupFlags::DATA)]);
        store.insert_record(record(GIB, 64 * MIB, 0, BlockGroupFlags::METADATA));
        let err = TestHarness::open(layout, store, MemoryExtentSource::new(), |b| b)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InconsistentMetadata);
    }

    #[test_log::test(tokio::test)]
    async fn test_rescue_fills_dummy_groups() {
        let (layout, store) = seeded(&[
            record(GIB, 64 * MIB, 0, BlockGroupFlags::DATA),
            record(GIB + 64 * MIB, 64 * MIB, 80 * MIB, BlockGroupFlags::DATA),
        ]);
        layout.insert_chunk(2 * GIB, 32 * MIB, BlockGroupFlags::METADATA);
        let harness = TestHarness::open(layout, store, MemoryExtentSource::new(), |b| {
            b.with_rescue_ignore_bad_groups(true)
        })
        .await
        .unwrap();
        let manager = &harness.manager;

        // The good record loaded before the failure is kept.
        assert!(manager.lookup_block_group(GIB).is_some());
        for start in [GIB + 64 * MIB, 2 * GIB] {
            let group = manager.lookup_block_group(start).unwrap();
            assert!(group.is_read_only());
            assert_eq!(group.stats().used, group.length());
        }
        assert_eq!(manager.space_info_stats(ContentClass::Metadata).used, 32 * MIB);
    }
}
