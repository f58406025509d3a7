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

//! In-memory collaborators and a harness for testing the space manager.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use cowspace_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    units::{align_down, GIB, MIB},
};
use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::{
    block_group::{BlockGroupRef, Extent},
    external::{
        BlockGroupRecord, ChunkLayout, ChunkMapping, DeviceLayout, ExclusiveOp, ExtentSource, PersistentStore,
        Relocator, Stripe, TransactionContext, UsedExtent,
    },
    manager::{SpaceManager, SpaceManagerBuildContext, SpaceManagerBuilder},
    profile::{BlockGroupFlags, ContentClass, RaidProfile},
};

/// Used extents kept in memory.
#[derive(Debug, Default)]
pub struct MemoryExtentSource {
    extents: Mutex<BTreeMap<u64, u64>>,
    fail: AtomicBool,
    scans: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MemoryExtentSource {
    /// Create an empty extent source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a used extent.
    pub fn insert(&self, start: u64, len: u64) {
        self.extents.lock().insert(start, len);
    }

    /// Forget the used extent starting at `start`.
    pub fn remove(&self, start: u64) -> Option<u64> {
        self.extents.lock().remove(&start)
    }

    /// All used extents, sorted by start address.
    pub fn extents(&self) -> Vec<UsedExtent> {
        self.extents
            .lock()
            .iter()
            .map(|(&start, &len)| UsedExtent { start, len })
            .collect()
    }

    /// Used extents starting inside `[start, end)`.
    pub fn extents_in(&self, start: u64, end: u64) -> Vec<UsedExtent> {
        self.extents
            .lock()
            .range(start..end)
            .map(|(&start, &len)| UsedExtent { start, len })
            .collect()
    }

    /// Make the following scans fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Delay every scan by `delay`.
    pub fn set_scan_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of scans served so far.
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }
}

impl ExtentSource for MemoryExtentSource {
    fn scan_used_extents(&self, start: u64, end: u64, limit: usize) -> BoxFuture<'static, Result<Vec<UsedExtent>>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let delay = *self.delay.lock();

        let res = if self.fail.load(Ordering::Relaxed) {
            Err(Error::new(ErrorKind::Io, "extent scan failed")
                .with_context("start", start)
                .with_context("end", end))
        } else {
            let extents = self.extents.lock();
            // An extent starting before `start` may still reach into the range.
            let head = extents
                .range(..start)
                .next_back()
                .filter(|&(&s, &l)| s + l > start)
                .map(|(&s, &l)| (s, l));
            let res = head
                .into_iter()
                .chain(extents.range((Bound::Included(start), Bound::Excluded(end))).map(|(&s, &l)| (s, l)))
                .take(limit)
                .map(|(start, len)| UsedExtent { start, len })
                .collect();
            Ok(res)
        };

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            res
        }
        .boxed()
    }
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    records: BTreeMap<u64, BlockGroupRecord>,
    snapshots: HashMap<u64, Vec<(u64, u64)>>,
    device_extents: HashMap<u64, Vec<Stripe>>,
}

/// Block group records, device extents and free space snapshots kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    fail_persist_not_found: AtomicBool,
    fail_persist: AtomicBool,
    fail_load: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, sorted by start address.
    pub fn records(&self) -> Vec<BlockGroupRecord> {
        self.inner.lock().records.values().copied().collect()
    }

    /// The record of the group starting at `start`.
    pub fn record(&self, start: u64) -> Option<BlockGroupRecord> {
        self.inner.lock().records.get(&start).copied()
    }

    /// Insert or replace a record, bypassing failure injection.
    pub fn insert_record(&self, record: BlockGroupRecord) {
        self.inner.lock().records.insert(record.start, record);
    }

    /// The free space snapshot of the group starting at `start`.
    pub fn snapshot(&self, start: u64) -> Option<Vec<(u64, u64)>> {
        self.inner.lock().snapshots.get(&start).cloned()
    }

    /// Replace the free space snapshot of the group starting at `start`.
    pub fn set_snapshot(&self, start: u64, entries: Vec<(u64, u64)>) {
        self.inner.lock().snapshots.insert(start, entries);
    }

    /// The device extents persisted for the group starting at `start`.
    pub fn device_extents(&self, start: u64) -> Option<Vec<Stripe>> {
        self.inner.lock().device_extents.get(&start).cloned()
    }

    /// Make record inserts and updates fail with [`ErrorKind::NotFound`].
    pub fn fail_persist_not_found(&self, fail: bool) {
        self.fail_persist_not_found.store(fail, Ordering::Relaxed);
    }

    /// Make record inserts and updates fail with [`ErrorKind::Io`].
    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::Relaxed);
    }

    /// Make snapshot loads fail with [`ErrorKind::Io`].
    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::Relaxed);
    }

    fn check_persist(&self, start: u64) -> Result<()> {
        if self.fail_persist.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::Io, "persist failed").with_context("start", start));
        }
        if self.fail_persist_not_found.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::NotFound, "record not found").with_context("start", start));
        }
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn load_block_group_records(&self) -> BoxFuture<'static, Result<Vec<BlockGroupRecord>>> {
        let records = self.records();
        async move { Ok(records) }.boxed()
    }

    fn load_cached_free_space(&self, start: u64, _length: u64) -> BoxFuture<'static, Result<Option<Vec<(u64, u64)>>>> {
        let res = if self.fail_load.load(Ordering::Relaxed) {
            Err(Error::new(ErrorKind::Io, "snapshot load failed").with_context("start", start))
        } else {
            Ok(self.snapshot(start))
        };
        async move { res }.boxed()
    }

    fn persist_block_group_record(&self, record: BlockGroupRecord) -> BoxFuture<'static, Result<()>> {
        let res = self.check_persist(record.start).map(|()| {
            self.inner.lock().records.insert(record.start, record);
        });
        async move { res }.boxed()
    }

    fn update_block_group_record(&self, record: BlockGroupRecord) -> BoxFuture<'static, Result<()>> {
        let res = self.check_persist(record.start).and_then(|()| {
            let mut inner = self.inner.lock();
            match inner.records.get_mut(&record.start) {
                Some(r) => {
                    *r = record;
                    Ok(())
                }
                None => Err(Error::new(ErrorKind::NotFound, "record not found").with_context("start", record.start)),
            }
        });
        async move { res }.boxed()
    }

    fn persist_device_extents(&self, start: u64, stripes: Vec<Stripe>) -> BoxFuture<'static, Result<()>> {
        self.inner.lock().device_extents.insert(start, stripes);
        async move { Ok(()) }.boxed()
    }

    fn persist_cached_free_space(&self, start: u64, entries: Vec<(u64, u64)>) -> BoxFuture<'static, Result<()>> {
        self.set_snapshot(start, entries);
        async move { Ok(()) }.boxed()
    }

    fn remove_block_group_record(&self, start: u64, _length: u64) -> BoxFuture<'static, Result<()>> {
        let mut inner = self.inner.lock();
        inner.records.remove(&start);
        inner.snapshots.remove(&start);
        inner.device_extents.remove(&start);
        async move { Ok(()) }.boxed()
    }
}

#[derive(Debug)]
struct Chunk {
    length: u64,
    flags: BlockGroupFlags,
    readonly: bool,
    device_bytes: u64,
}

#[derive(Debug)]
struct MemoryDeviceLayoutInner {
    rw_devices: usize,
    unallocated: u64,
    chunks: BTreeMap<u64, Chunk>,
    next_logical: u64,
    next_physical: u64,
    released: Vec<u64>,
    allocations: usize,
    attempts: usize,
    gate: Option<Arc<Semaphore>>,
}

/// A device layout handing out chunks from a pool of unallocated bytes.
///
/// Logical addresses start at 1 GiB, past the first superblock mirrors.
#[derive(Debug, Clone)]
pub struct MemoryDeviceLayout {
    inner: Arc<Mutex<MemoryDeviceLayoutInner>>,
    blocked: Arc<AtomicUsize>,
}

impl MemoryDeviceLayout {
    /// Create a layout of `rw_devices` writable devices with `unallocated` device bytes in total.
    pub fn new(rw_devices: usize, unallocated: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryDeviceLayoutInner {
                rw_devices,
                unallocated,
                chunks: BTreeMap::new(),
                next_logical: GIB,
                next_physical: 0,
                released: vec![],
                allocations: 0,
                attempts: 0,
                gate: None,
            })),
            blocked: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Map a chunk without taking device bytes from the pool.
    pub fn insert_chunk(&self, start: u64, length: u64, flags: BlockGroupFlags) {
        let mut inner = self.inner.lock();
        inner.chunks.insert(
            start,
            Chunk {
                length,
                flags,
                readonly: false,
                device_bytes: 0,
            },
        );
        inner.next_logical = inner.next_logical.max(start + length);
    }

    /// Mark the chunk starting at `start` as backed by a read-only device.
    pub fn set_chunk_readonly(&self, start: u64) {
        if let Some(chunk) = self.inner.lock().chunks.get_mut(&start) {
            chunk.readonly = true;
        }
    }

    /// Change the number of writable devices.
    pub fn set_rw_devices(&self, rw_devices: usize) {
        self.inner.lock().rw_devices = rw_devices;
    }

    /// Add device bytes to the pool.
    pub fn grow(&self, bytes: u64) {
        self.inner.lock().unallocated += bytes;
    }

    /// Number of successful chunk allocations.
    pub fn allocations(&self) -> usize {
        self.inner.lock().allocations
    }

    /// Number of chunk allocation requests, successful or not.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    /// Start addresses of the released chunks, in release order.
    pub fn released(&self) -> Vec<u64> {
        self.inner.lock().released.clone()
    }

    /// Device bytes left in the pool.
    pub fn unallocated(&self) -> u64 {
        self.inner.lock().unallocated
    }

    /// Hold every following chunk allocation until [`MemoryDeviceLayout::resume`].
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.gate.is_none() {
            inner.gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    /// Let the held chunk allocations proceed.
    pub fn resume(&self) {
        if let Some(gate) = self.inner.lock().gate.take() {
            gate.close();
        }
    }

    /// Number of chunk allocations currently held by [`MemoryDeviceLayout::pause`].
    pub fn blocked_allocations(&self) -> usize {
        self.blocked.load(Ordering::Acquire)
    }

    fn do_allocate(&self, flags: BlockGroupFlags, max_bytes: u64) -> Result<ChunkLayout> {
        let mut inner = self.inner.lock();
        inner.attempts += 1;

        let profile = flags.profile();
        let attr = profile.attr();
        if attr.devs_min > inner.rw_devices {
            return Err(Error::insufficient_devices(profile, attr.devs_min, inner.rw_devices));
        }

        let factor = profile.factor();
        let length = align_down(max_bytes.min(inner.unallocated / factor), MIB);
        if length == 0 {
            return Err(Error::no_space("devices", max_bytes * factor, inner.unallocated));
        }

        let start = inner.next_logical;
        let physical = inner.next_physical;
        let rw = inner.rw_devices as u64;
        let stripes = (0..factor)
            .map(|i| Stripe {
                devid: i % rw + 1,
                physical,
                length,
            })
            .collect();

        inner.unallocated -= length * factor;
        inner.next_logical += length;
        inner.next_physical += length;
        inner.allocations += 1;
        inner.chunks.insert(
            start,
            Chunk {
                length,
                flags,
                readonly: false,
                device_bytes: length * factor,
            },
        );

        Ok(ChunkLayout {
            start,
            length,
            flags,
            stripes,
        })
    }
}

impl DeviceLayout for MemoryDeviceLayout {
    fn rw_devices(&self) -> usize {
        self.inner.lock().rw_devices
    }

    fn unallocated_bytes(&self) -> u64 {
        self.inner.lock().unallocated
    }

    fn allocate_chunk(&self, flags: BlockGroupFlags, max_bytes: u64) -> BoxFuture<'static, Result<ChunkLayout>> {
        let this = self.clone();
        let gate = self.inner.lock().gate.clone();
        async move {
            if let Some(gate) = gate {
                this.blocked.fetch_add(1, Ordering::AcqRel);
                // Closed on resume.
                let _ = gate.acquire().await;
                this.blocked.fetch_sub(1, Ordering::AcqRel);
            }
            this.do_allocate(flags, max_bytes)
        }
        .boxed()
    }

    fn chunk_mappings(&self) -> Vec<ChunkMapping> {
        self.inner
            .lock()
            .chunks
            .iter()
            .map(|(&start, chunk)| ChunkMapping {
                start,
                length: chunk.length,
                flags: chunk.flags,
            })
            .collect()
    }

    fn is_chunk_writeable(&self, start: u64) -> bool {
        self.inner.lock().chunks.get(&start).is_some_and(|c| !c.readonly)
    }

    fn release_chunk(&self, start: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let chunk = inner
            .chunks
            .remove(&start)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "chunk not found").with_context("start", start))?;
        inner.unallocated += chunk.device_bytes;
        inner.released.push(start);
        Ok(())
    }
}

/// Transaction hooks kept in memory.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    generation: AtomicU64,
    aborted: AtomicBool,
    exclusive: Mutex<Option<ExclusiveOp>>,
    conversion: Mutex<[Option<RaidProfile>; 3]>,
}

impl MemoryTransaction {
    /// Create a running, not aborted transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next transaction generation.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The running exclusive operation.
    pub fn exclusive_op(&self) -> Option<ExclusiveOp> {
        *self.exclusive.lock()
    }

    /// Set or clear the target profile of a redundancy conversion of `class`.
    pub fn set_conversion_target(&self, class: ContentClass, target: Option<RaidProfile>) {
        self.conversion.lock()[class.index()] = target;
    }
}

impl TransactionContext for MemoryTransaction {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    fn abort(&self, error: &Error) {
        tracing::warn!("[memory transaction]: aborted: {error}");
        self.aborted.store(true, Ordering::Relaxed);
    }

    fn try_start_exclusive_op(&self, op: ExclusiveOp) -> bool {
        let mut exclusive = self.exclusive.lock();
        if exclusive.is_some() {
            return false;
        }
        *exclusive = Some(op);
        true
    }

    fn finish_exclusive_op(&self, op: ExclusiveOp) {
        let mut exclusive = self.exclusive.lock();
        if *exclusive == Some(op) {
            *exclusive = None;
        }
    }

    fn conversion_target(&self, class: ContentClass) -> Option<RaidProfile> {
        self.conversion.lock()[class.index()]
    }
}

/// Relocates the extents recorded in a [`MemoryExtentSource`] through the space manager itself.
#[derive(Debug)]
pub struct MemoryRelocator {
    extents: Arc<MemoryExtentSource>,
    fail: AtomicBool,
    relocated: AtomicUsize,
}

impl MemoryRelocator {
    /// Create a relocator moving the extents of `extents`.
    pub fn new(extents: Arc<MemoryExtentSource>) -> Self {
        Self {
            extents,
            fail: AtomicBool::new(false),
            relocated: AtomicUsize::new(0),
        }
    }

    /// Make the following relocations fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Number of extents moved so far.
    pub fn relocated(&self) -> usize {
        self.relocated.load(Ordering::Relaxed)
    }
}

impl Relocator for MemoryRelocator {
    fn relocate(&self, manager: SpaceManager, group: BlockGroupRef) -> BoxFuture<'static, Result<()>> {
        if self.fail.load(Ordering::Relaxed) {
            let e = Error::new(ErrorKind::Io, "relocation failed").with_context("start", group.start());
            return async move { Err(e) }.boxed();
        }

        let extents = self.extents.clone();
        let todo = extents.extents_in(group.start(), group.end());
        let moved = todo.len();
        self.relocated.fetch_add(moved, Ordering::Relaxed);

        async move {
            let class = ContentClass::of(group.flags());
            for old in todo {
                let (target, new) = manager.find_and_reserve(class, old.len).await?;
                manager.commit_extent(&target, new);
                extents.remove(old.start);
                extents.insert(new.start, new.len);
                manager.release(
                    &group,
                    Extent {
                        start: old.start,
                        len: old.len,
                    },
                    true,
                );
            }
            tracing::debug!(start = group.start(), moved, "[memory relocator]: block group relocated");
            Ok(())
        }
        .boxed()
    }
}

/// A space manager wired to in-memory collaborators.
#[derive(Debug)]
pub struct TestHarness {
    /// The space manager.
    pub manager: SpaceManager,
    /// Used extents read by caching and moved by relocation.
    pub extents: Arc<MemoryExtentSource>,
    /// Persisted records.
    pub store: Arc<MemoryStore>,
    /// Chunk mappings and unallocated device bytes.
    pub layout: Arc<MemoryDeviceLayout>,
    /// Transaction hooks.
    pub txn: Arc<MemoryTransaction>,
    /// Relocator of the reclaim passes.
    pub relocator: Arc<MemoryRelocator>,
}

impl TestHarness {
    /// Mount a space manager on the given collaborators.
    pub async fn open<F>(
        layout: MemoryDeviceLayout,
        store: MemoryStore,
        extents: MemoryExtentSource,
        configure: F,
    ) -> Result<Self>
    where
        F: FnOnce(SpaceManagerBuilder) -> SpaceManagerBuilder,
    {
        let extents = Arc::new(extents);
        Self::build(
            Arc::new(layout),
            Arc::new(store),
            extents.clone(),
            Arc::new(MemoryTransaction::new()),
            Arc::new(MemoryRelocator::new(extents)),
            configure,
        )
        .await
    }

    async fn build<F>(
        layout: Arc<MemoryDeviceLayout>,
        store: Arc<MemoryStore>,
        extents: Arc<MemoryExtentSource>,
        txn: Arc<MemoryTransaction>,
        relocator: Arc<MemoryRelocator>,
        configure: F,
    ) -> Result<Self>
    where
        F: FnOnce(SpaceManagerBuilder) -> SpaceManagerBuilder,
    {
        let manager = configure(SpaceManagerBuilder::new("test"))
            .build(SpaceManagerBuildContext {
                extent_source: extents.clone(),
                store: store.clone(),
                layout: layout.clone(),
                txn: txn.clone(),
                relocator: relocator.clone(),
                metrics: Arc::new(Metrics::noop()),
            })
            .await?;
        Ok(Self {
            manager,
            extents,
            store,
            layout,
            txn,
            relocator,
        })
    }

    /// Mount a space manager on a single device with no unallocated bytes.
    pub async fn new<F>(configure: F) -> Result<Self>
    where
        F: FnOnce(SpaceManagerBuilder) -> SpaceManagerBuilder,
    {
        Self::open(
            MemoryDeviceLayout::new(1, 0),
            MemoryStore::new(),
            MemoryExtentSource::new(),
            configure,
        )
        .await
    }

    /// Mount a space manager with one persisted, empty data group of `length` bytes at 1 GiB.
    pub async fn single_data_group(length: u64) -> Result<Self> {
        let harness = Self::new(|b| b).await?;
        harness.add_data_group(GIB, length).await?;
        Ok(harness)
    }

    /// Map a single data chunk and create its persisted block group.
    pub async fn add_data_group(&self, start: u64, length: u64) -> Result<BlockGroupRef> {
        self.add_group(start, length, BlockGroupFlags::DATA).await
    }

    /// Map a chunk and create its persisted block group.
    pub async fn add_group(&self, start: u64, length: u64, flags: BlockGroupFlags) -> Result<BlockGroupRef> {
        self.layout.insert_chunk(start, length, flags);
        let group = self
            .manager
            .make_block_group(ChunkLayout {
                start,
                length,
                flags,
                stripes: vec![Stripe {
                    devid: 1,
                    physical: start,
                    length,
                }],
            })
            .await?;
        self.manager.create_pending_block_groups().await?;
        Ok(group)
    }

    /// Commit the running transaction and start the next one.
    pub async fn commit(&self) -> Result<()> {
        self.manager.commit_transaction().await?;
        self.txn.bump_generation();
        Ok(())
    }

    /// Commit, close the space manager and mount a new one on the same collaborators.
    pub async fn reopen<F>(self, configure: F) -> Result<Self>
    where
        F: FnOnce(SpaceManagerBuilder) -> SpaceManagerBuilder,
    {
        self.manager.commit_transaction().await?;
        self.manager.close().await?;
        Self::build(
            self.layout,
            self.store,
            self.extents,
            self.txn,
            self.relocator,
            configure,
        )
        .await
    }
}
