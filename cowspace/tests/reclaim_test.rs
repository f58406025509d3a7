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

use std::time::Duration;

use cowspace::{
    test_utils::{MemoryDeviceLayout, MemoryExtentSource, MemoryStore, TestHarness},
    BlockGroupFlags, BlockGroupRecord, BlockGroupStats, CacheState, ContentClass, ErrorKind, Extent, SpaceInfoStats,
};
use cowspace_common::units::{GIB, MIB};

async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[test_log::test(tokio::test)]
async fn test_free_space_snapshot_survives_reopen() {
    let layout = MemoryDeviceLayout::new(1, 0);
    let store = MemoryStore::new();
    layout.insert_chunk(GIB, 64 * MIB, BlockGroupFlags::METADATA);
    store.insert_record(BlockGroupRecord {
        start: GIB,
        length: 64 * MIB,
        used: 8 * MIB,
        flags: BlockGroupFlags::METADATA,
    });
    let extents = MemoryExtentSource::new();
    extents.insert(GIB, 8 * MIB);

    let harness = TestHarness::open(layout, store, extents, |b| b.with_space_cache(true))
        .await
        .unwrap();
    let manager = &harness.manager;
    let group = manager.lookup_block_group(GIB).unwrap();
    manager.cache_block_group(&group, true).await.unwrap();
    assert!(harness.extents.scans() > 0);

    let (g, extent) = manager.find_and_reserve(ContentClass::Metadata, 4 * MIB).await.unwrap();
    assert_eq!(extent.start, GIB + 8 * MIB);
    manager.commit_extent(&g, extent);
    harness.extents.insert(extent.start, extent.len);
    harness.commit().await.unwrap();

    assert_eq!(harness.store.record(GIB).unwrap().used, 12 * MIB);
    assert_eq!(harness.store.snapshot(GIB), Some(vec![(GIB + 12 * MIB, 52 * MIB)]));

    let harness = harness.reopen(|b| b.with_space_cache(true)).await.unwrap();
    let manager = &harness.manager;
    let group = manager.lookup_block_group(GIB).unwrap();
    assert_eq!(group.cache_state(), CacheState::NotCached);
    assert_eq!(group.stats().used, 12 * MIB);

    let scans = harness.extents.scans();
    manager.cache_block_group(&group, true).await.unwrap();
    assert_eq!(harness.extents.scans(), scans);
    assert_eq!(
        group.free_space_entries(),
        vec![Extent {
            start: GIB + 12 * MIB,
            len: 52 * MIB
        }]
    );
}

#[test_log::test(tokio::test)]
async fn test_mismatched_snapshot_falls_back_to_scan() {
    let layout = MemoryDeviceLayout::new(1, 0);
    let store = MemoryStore::new();
    layout.insert_chunk(GIB, 64 * MIB, BlockGroupFlags::METADATA);
    store.insert_record(BlockGroupRecord {
        start: GIB,
        length: 64 * MIB,
        used: 8 * MIB,
        flags: BlockGroupFlags::METADATA,
    });
    // Claims 60 MiB free while the record says 56 MiB.
    store.set_snapshot(GIB, vec![(GIB + 4 * MIB, 60 * MIB)]);
    let extents = MemoryExtentSource::new();
    extents.insert(GIB, 8 * MIB);

    let harness = TestHarness::open(layout, store, extents, |b| b.with_space_cache(true))
        .await
        .unwrap();
    let group = harness.manager.lookup_block_group(GIB).unwrap();
    harness.manager.cache_block_group(&group, true).await.unwrap();

    assert!(harness.extents.scans() > 0);
    assert_eq!(group.stats().free_bytes, 56 * MIB);
}

#[test_log::test(tokio::test)]
async fn test_failed_scan_excludes_group() {
    let layout = MemoryDeviceLayout::new(1, 0);
    let store = MemoryStore::new();
    layout.insert_chunk(GIB, 64 * MIB, BlockGroupFlags::METADATA);
    store.insert_record(BlockGroupRecord {
        start: GIB,
        length: 64 * MIB,
        used: 8 * MIB,
        flags: BlockGroupFlags::METADATA,
    });
    let extents = MemoryExtentSource::new();
    extents.set_fail(true);

    let harness = TestHarness::open(layout, store, extents, |b| b).await.unwrap();
    let manager = &harness.manager;
    let group = manager.lookup_block_group(GIB).unwrap();

    let err = manager.cache_block_group(&group, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CacheError);
    assert_eq!(group.cache_state(), CacheState::Error);

    // Not retried within the mount.
    harness.extents.set_fail(false);
    let err = manager.find_and_reserve(ContentClass::Metadata, MIB).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSpace);
}

#[test_log::test(tokio::test)]
async fn test_underused_group_is_relocated() {
    let harness = TestHarness::open(
        MemoryDeviceLayout::new(1, 4 * GIB),
        MemoryStore::new(),
        MemoryExtentSource::new(),
        |b| b.with_reclaim_threshold(ContentClass::Data, 50),
    )
    .await
    .unwrap();
    let manager = &harness.manager;
    let group = harness.add_data_group(GIB, 64 * MIB).await.unwrap();

    let (_, e1) = manager.find_and_reserve(ContentClass::Data, 16 * MIB).await.unwrap();
    let (_, e2) = manager.find_and_reserve(ContentClass::Data, 16 * MIB).await.unwrap();
    for e in [e1, e2] {
        manager.commit_extent(&group, e);
        harness.extents.insert(e.start, e.len);
    }
    // Takes the group off the unused list, it is the only one.
    assert_eq!(manager.delete_unused_block_groups().await.unwrap(), 0);

    manager.release(&group, e2, true);
    harness.extents.remove(e2.start);
    harness.commit().await.unwrap();

    assert_eq!(manager.reclaim_block_groups().await.unwrap(), 1);
    assert!(group.stats().removed);
    assert!(manager.lookup_block_group(GIB).is_none());
    assert_eq!(harness.layout.released(), vec![GIB]);
    assert_eq!(harness.relocator.relocated(), 1);

    let moved = harness.extents.extents();
    assert_eq!(moved.len(), 1);
    assert!(moved[0].start >= GIB + 64 * MIB);
    let target = manager.lookup_block_group(moved[0].start).unwrap();
    assert_eq!(target.stats().used, 16 * MIB);

    let stats = manager.space_info_stats(ContentClass::Data);
    assert_eq!(stats.used, 16 * MIB);
    assert_eq!(stats.readonly, 0);
    assert_eq!(stats.pinned, 0);
    assert_eq!(harness.txn.exclusive_op(), None);
}

#[test_log::test(tokio::test)]
async fn test_failed_relocation_requeues_group() {
    let harness = TestHarness::open(
        MemoryDeviceLayout::new(1, 4 * GIB),
        MemoryStore::new(),
        MemoryExtentSource::new(),
        |b| b.with_reclaim_threshold(ContentClass::Data, 50),
    )
    .await
    .unwrap();
    let manager = &harness.manager;
    let group = harness.add_data_group(GIB, 64 * MIB).await.unwrap();

    let (_, e1) = manager.find_and_reserve(ContentClass::Data, 16 * MIB).await.unwrap();
    let (_, e2) = manager.find_and_reserve(ContentClass::Data, 16 * MIB).await.unwrap();
    manager.commit_extent(&group, e1);
    manager.commit_extent(&group, e2);
    manager.delete_unused_block_groups().await.unwrap();
    manager.release(&group, e2, true);
    harness.commit().await.unwrap();

    harness.relocator.set_fail(true);
    assert_eq!(manager.reclaim_block_groups().await.unwrap(), 0);
    assert!(!group.is_read_only());
    assert!(manager.lookup_block_group(GIB).is_some());

    harness.relocator.set_fail(false);
    harness.extents.insert(e1.start, e1.len);
    assert_eq!(manager.reclaim_block_groups().await.unwrap(), 1);
    assert!(manager.lookup_block_group(GIB).is_none());
}

#[test_log::test(tokio::test)]
async fn test_background_engine_removes_unused_groups() {
    let harness = TestHarness::new(|b| b.with_background_reclaim_interval(Duration::from_millis(10)))
        .await
        .unwrap();
    let manager = harness.manager.clone();
    harness.add_data_group(GIB, 64 * MIB).await.unwrap();
    harness.add_data_group(GIB + 64 * MIB, 64 * MIB).await.unwrap();
    manager.trigger_reclaim();

    wait_until(|| manager.block_groups().len() == 1).await;
    assert_eq!(harness.layout.released().len(), 1);

    manager.close().await.unwrap();
    assert!(manager.block_groups().is_empty());
    let err = manager.delete_unused_block_groups().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
}

#[test_log::test(tokio::test)]
async fn test_stats_serialize() {
    let harness = TestHarness::single_data_group(64 * MIB).await.unwrap();
    let manager = &harness.manager;
    let (group, extent) = manager.find_and_reserve(ContentClass::Data, 4 * MIB).await.unwrap();
    manager.commit_extent(&group, extent);

    let stats = manager.block_group_stats(GIB).unwrap();
    let json = serde_json::to_string(&stats).unwrap();
    let back: BlockGroupStats = serde_json::from_str(&json).unwrap();
    assert_eq!(back, stats);
    assert_eq!(back.used, 4 * MIB);

    let all = manager.all_space_info_stats();
    assert_eq!(all.len(), 3);
    let json = serde_json::to_string(&all).unwrap();
    let back: Vec<SpaceInfoStats> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, all);
    assert!(back.iter().any(|s| s.used == 4 * MIB));
}
