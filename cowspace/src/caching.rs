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

//! Lazy population of block group free space indices.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use cowspace_common::error::{Error, Result};
use tokio::sync::watch;

use crate::{
    block_group::{BlockGroup, BlockGroupRef, BlockGroupState, CacheState},
    free_space::FreeSpaceIndex,
    manager::SpaceManager,
    profile::SizeClass,
};

const SIZE_CLASS_SAMPLES: u64 = 5;

/// Progress of one caching task, shared by the task and its waiters.
#[derive(Debug)]
pub(crate) struct CachingControl {
    progress: watch::Sender<u64>,
    /// Everything below the cursor has been resolved into the free space index.
    cursor: AtomicU64,
}

impl CachingControl {
    fn new(start: u64) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            progress,
            cursor: AtomicU64::new(start),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    fn tick(&self) {
        self.progress.send_modify(|v| *v += 1);
    }
}

/// Addresses below the returned one are resolved in the free space index of the group.
pub(crate) fn cached_up_to(group: &BlockGroup, state: &BlockGroupState) -> u64 {
    match state.cached {
        CacheState::Finished => group.end(),
        CacheState::Started => state
            .caching_ctl
            .as_ref()
            .map(|ctl| ctl.cursor())
            .unwrap_or(group.start()),
        CacheState::NotCached | CacheState::Error => group.start(),
    }
}

impl SpaceManager {
    /// Start populating the free space index of `group` in the background, if not started yet.
    ///
    /// With `wait`, returns once caching has finished.
    pub async fn cache_block_group(&self, group: &BlockGroupRef, wait: bool) -> Result<()> {
        let ctl = {
            let mut state = group.state();
            match state.cached {
                CacheState::Finished => return Ok(()),
                CacheState::Error => return Err(Error::cache_error(group.start())),
                CacheState::Started => None,
                CacheState::NotCached => {
                    let ctl = Arc::new(CachingControl::new(group.start()));
                    state.cached = CacheState::Started;
                    state.caching_ctl = Some(ctl.clone());
                    Some(ctl)
                }
            }
        };

        if let Some(ctl) = ctl {
            self.inner.lists.lock().caching.push(group.clone());
            self.inner.metrics.space_cache_start.increase(1);
            tracing::debug!(start = group.start(), "[caching]: start caching block group");

            let this = self.clone();
            let g = group.clone();
            self.inner.runtime.background().spawn(async move {
                this.caching_task(g, ctl).await;
            });
        }

        if wait {
            self.wait_block_group_cache_done(group).await
        } else {
            Ok(())
        }
    }

    /// Wait until caching of `group` is done, or until at least `bytes` free bytes are visible in its index.
    pub async fn wait_block_group_cache_progress(&self, group: &BlockGroupRef, bytes: u64) {
        let Some(ctl) = group.state().caching_ctl.clone() else {
            return;
        };
        // Subscribe before checking, so no tick between the check and the wait is lost.
        let mut rx = ctl.progress.subscribe();
        loop {
            {
                let state = group.state();
                if state.cached.is_done() || state.free_space.free_bytes() >= bytes {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until caching of `group` reaches a terminal state.
    pub async fn wait_block_group_cache_done(&self, group: &BlockGroupRef) -> Result<()> {
        let ctl = {
            let state = group.state();
            match state.cached {
                CacheState::Finished => return Ok(()),
                CacheState::Error => return Err(Error::cache_error(group.start())),
                CacheState::NotCached => return Ok(()),
                CacheState::Started => state.caching_ctl.clone(),
            }
        };
        if let Some(ctl) = ctl {
            let mut rx = ctl.progress.subscribe();
            loop {
                if group.state().cached.is_done() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        let cached = group.state().cached;
        match cached {
            CacheState::Error => Err(Error::cache_error(group.start())),
            _ => Ok(()),
        }
    }

    async fn caching_task(self, group: BlockGroupRef, ctl: Arc<CachingControl>) {
        let now = Instant::now();

        if group.uses_size_class() {
            self.load_size_class(&group).await;
        }

        let mut loaded = false;
        if self.inner.config.space_cache {
            match self.load_cached_free_space(&group, &ctl).await {
                Ok(v) => loaded = v,
                Err(e) => tracing::warn!(
                    start = group.start(),
                    "[caching]: failed to load free space snapshot, fall back to scan: {e}"
                ),
            }
        }
        let res = if loaded {
            Ok(())
        } else {
            self.scan_free_space(&group, &ctl).await
        };

        {
            let mut state = group.state();
            state.cached = match res {
                Ok(()) => CacheState::Finished,
                Err(_) => CacheState::Error,
            };
            state.caching_ctl = None;
            if res.is_ok() {
                ctl.cursor.store(group.end(), Ordering::Release);
            }
        }
        ctl.tick();

        self.inner
            .lists
            .lock()
            .caching
            .retain(|g| !Arc::ptr_eq(g, &group));

        self.inner
            .metrics
            .space_caching_duration
            .record(now.elapsed().as_secs_f64());
        match res {
            Ok(()) => {
                self.inner.metrics.space_cache_finish.increase(1);
                tracing::debug!(start = group.start(), loaded, "[caching]: block group cached");
            }
            Err(e) => {
                self.inner.metrics.space_cache_error.increase(1);
                tracing::error!(
                    start = group.start(),
                    "[caching]: caching failed, block group excluded from allocation: {e}"
                );
            }
        }
    }

    /// Sample a few used extents to pick the size class of an untyped data group.
    async fn load_size_class(&self, group: &BlockGroupRef) {
        let step = group.length() / SIZE_CLASS_SAMPLES;
        if step == 0 {
            return;
        }
        let mut min: Option<u64> = None;
        for i in 0..SIZE_CLASS_SAMPLES {
            let s = group.start() + i * step;
            match self.inner.extent_source.scan_used_extents(s, s + step, 1).await {
                Ok(extents) => {
                    if let Some(e) = extents.first() {
                        min = Some(min.map_or(e.len, |m| m.min(e.len)));
                    }
                }
                Err(e) => {
                    tracing::warn!(start = group.start(), "[caching]: size class sampling failed: {e}");
                    return;
                }
            }
        }
        if let Some(min) = min {
            let mut state = group.state();
            if state.size_class == SizeClass::None {
                state.size_class = SizeClass::of(min);
            }
        }
    }

    /// Returns `false` if there is no usable snapshot.
    async fn load_cached_free_space(&self, group: &BlockGroupRef, ctl: &CachingControl) -> Result<bool> {
        let Some(entries) = self
            .inner
            .store
            .load_cached_free_space(group.start(), group.length())
            .await?
        else {
            return Ok(false);
        };

        let mut index = FreeSpaceIndex::new();
        for (s, l) in entries {
            let valid = l > 0
                && s >= group.start()
                && s.checked_add(l).is_some_and(|e| e <= group.end())
                && !group.overlaps_excluded(s, l)
                && index.insert(s, l);
            if !valid {
                tracing::warn!(
                    start = group.start(),
                    entry_start = s,
                    entry_len = l,
                    "[caching]: invalid free space snapshot entry, ignore snapshot"
                );
                return Ok(false);
            }
        }

        let mut state = group.state();
        let expected = group.expected_free(&state);
        if index.free_bytes() != expected || !state.free_space.is_empty() {
            tracing::warn!(
                start = group.start(),
                snapshot = index.free_bytes(),
                expected,
                "[caching]: free space snapshot mismatch, ignore snapshot"
            );
            return Ok(false);
        }
        state.free_space = index;
        ctl.cursor.store(group.end(), Ordering::Release);
        Ok(true)
    }

    /// Insert the gaps between used extents into the free space index, resuming from a cursor batch by batch.
    async fn scan_free_space(&self, group: &BlockGroupRef, ctl: &CachingControl) -> Result<()> {
        let (start, end) = (group.start(), group.end());
        let batch = self.inner.config.caching_batch_size.max(1);
        let wake = self.inner.config.caching_wake_bytes;

        let mut last = start;
        let mut found = 0;

        loop {
            let extents = self
                .inner
                .extent_source
                .scan_used_extents(last, end, batch)
                .await
                .map_err(|e| Error::cache_error(start).with_source(e))?;
            let prev = last;

            {
                let mut state = group.state();
                for e in &extents {
                    let (es, ee) = (e.start.max(start), e.end().min(end));
                    if ee <= last {
                        continue;
                    }
                    if es > last {
                        found += group.add_new_free_space(&mut state, last, es);
                    }
                    last = ee;
                }
                if extents.len() < batch {
                    if last < end {
                        found += group.add_new_free_space(&mut state, last, end);
                    }
                    last = end;
                }
                ctl.cursor.store(last, Ordering::Release);
            }

            if found >= wake {
                ctl.tick();
                found = 0;
            }
            if last >= end {
                break;
            }
            if last == prev {
                return Err(Error::cache_error(start).with_context("cursor", last));
            }
            tokio::task::yield_now().await;
        }

        Ok(())
    }
}
