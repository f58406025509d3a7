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

use std::collections::BTreeMap;

/// In-memory index of free extents of one block group, keyed by start address.
///
/// Adjacent extents are merged on insert, so the index never holds two touching entries.
#[derive(Debug, Default, Clone)]
pub struct FreeSpaceIndex {
    entries: BTreeMap<u64, u64>,
    free: u64,
}

impl FreeSpaceIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total free bytes in the index.
    pub fn free_bytes(&self) -> u64 {
        self.free
    }

    /// Number of free extents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no free extent.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(start, len)` of free extents in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().map(|(&s, &l)| (s, l))
    }

    /// Length of the largest free extent.
    pub fn max_extent(&self) -> u64 {
        self.entries.values().copied().max().unwrap_or(0)
    }

    /// Insert the free extent `[start, start + len)`.
    ///
    /// Returns `false` and leaves the index untouched if the extent overlaps an existing one.
    pub fn insert(&mut self, start: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let end = start + len;

        if let Some((&ps, &pl)) = self.entries.range(..=start).next_back() {
            if ps + pl > start {
                return false;
            }
        }
        if let Some((&ns, _)) = self.entries.range(start..).next() {
            if ns < end {
                return false;
            }
        }

        let mut merged_start = start;
        let mut merged_len = len;
        if let Some((&ps, &pl)) = self.entries.range(..start).next_back() {
            if ps + pl == start {
                self.entries.remove(&ps);
                merged_start = ps;
                merged_len += pl;
            }
        }
        if let Some(nl) = self.entries.remove(&end) {
            merged_len += nl;
        }
        self.entries.insert(merged_start, merged_len);
        self.free += len;
        true
    }

    /// Remove `[start, start + len)`, which must lie entirely within one free extent.
    ///
    /// Returns `false` and leaves the index untouched otherwise.
    pub fn remove(&mut self, start: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let Some((&es, &el)) = self.entries.range(..=start).next_back() else {
            return false;
        };
        if es + el < start + len {
            return false;
        }

        self.entries.remove(&es);
        if es < start {
            self.entries.insert(es, start - es);
        }
        if start + len < es + el {
            self.entries.insert(start + len, es + el - start - len);
        }
        self.free -= len;
        true
    }

    /// Find the first free extent of at least `len` bytes, scanning from `hint` and wrapping around.
    pub fn find(&self, len: u64, hint: u64) -> Option<u64> {
        self.entries
            .range(hint..)
            .chain(self.entries.range(..hint))
            .find(|&(_, &l)| l >= len)
            .map(|(&s, _)| s)
    }

    /// Carve `len` bytes out of the first fitting free extent. Returns the start address.
    pub fn take(&mut self, len: u64, hint: u64) -> Option<u64> {
        let start = self.find(len, hint)?;
        let removed = self.remove(start, len);
        cowspace_common::strict_assert!(removed);
        Some(start)
    }

    /// Drop every free extent.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.free = 0;
    }
}
