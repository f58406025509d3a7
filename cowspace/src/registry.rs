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

use std::{collections::BTreeMap, sync::Arc};

use cowspace_common::error::{Error, ErrorKind, Result};
use parking_lot::RwLock;

use crate::block_group::BlockGroupRef;

/// Ordered index of all block groups keyed by start address.
#[derive(Debug, Default)]
pub struct BlockGroupRegistry {
    groups: RwLock<BTreeMap<u64, BlockGroupRef>>,
}

impl BlockGroupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a group. Fails with [`ErrorKind::AlreadyExists`] if a group with the same start is registered.
    pub fn insert(&self, group: BlockGroupRef) -> Result<()> {
        let mut groups = self.groups.write();
        if groups.contains_key(&group.start()) {
            return Err(Error::new(ErrorKind::AlreadyExists, "block group already registered")
                .with_context("start", group.start()));
        }
        groups.insert(group.start(), group);
        Ok(())
    }

    /// The group containing `addr`.
    pub fn lookup(&self, addr: u64) -> Option<BlockGroupRef> {
        self.groups
            .read()
            .range(..=addr)
            .next_back()
            .filter(|(_, group)| group.contains(addr))
            .map(|(_, group)| group.clone())
    }

    /// The group starting exactly at `start`.
    pub fn get(&self, start: u64) -> Option<BlockGroupRef> {
        self.groups.read().get(&start).cloned()
    }

    /// The group containing `addr`, or the first one after it.
    pub fn first_at_or_after(&self, addr: u64) -> Option<BlockGroupRef> {
        if let Some(group) = self.lookup(addr) {
            return Some(group);
        }
        self.groups.read().range(addr..).next().map(|(_, group)| group.clone())
    }

    /// The group following `group` in address order.
    pub fn next(&self, group: &BlockGroupRef) -> Option<BlockGroupRef> {
        self.groups
            .read()
            .range(group.start() + 1..)
            .next()
            .map(|(_, group)| group.clone())
    }

    /// Unlink the group starting at `start` if it is `group`.
    pub fn remove(&self, group: &BlockGroupRef) -> bool {
        let mut groups = self.groups.write();
        match groups.get(&group.start()) {
            Some(g) if Arc::ptr_eq(g, group) => {
                groups.remove(&group.start());
                true
            }
            _ => false,
        }
    }

    /// All groups in address order.
    pub fn groups(&self) -> Vec<BlockGroupRef> {
        self.groups.read().values().cloned().collect()
    }

    /// Number of registered groups.
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// Whether no group is registered.
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Unlink every group.
    pub fn clear(&self) -> Vec<BlockGroupRef> {
        std::mem::take(&mut *self.groups.write()).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use cowspace_common::units::MIB;
    use itertools::Itertools;

    use super::*;
    use crate::{
        block_group::BlockGroup,
        profile::{BlockGroupFlags, ContentClass},
        space_info::SpaceInfo,
    };

    fn groups(starts: &[u64]) -> Vec<BlockGroupRef> {
        let si = Arc::new(SpaceInfo::for_test(ContentClass::Data));
        starts
            .iter()
            .map(|&s| Arc::new(BlockGroup::new(s, 10 * MIB, BlockGroupFlags::DATA, si.clone(), vec![])))
            .collect()
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = BlockGroupRegistry::new();
        let gs = groups(&[0, 10 * MIB, 30 * MIB]);
        for g in &gs {
            registry.insert(g.clone()).unwrap();
        }

        let err = registry.insert(gs[1].clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        assert_eq!(registry.lookup(15 * MIB).unwrap().start(), 10 * MIB);
        assert!(registry.lookup(25 * MIB).is_none());
        assert_eq!(registry.first_at_or_after(25 * MIB).unwrap().start(), 30 * MIB);
        assert_eq!(registry.first_at_or_after(5 * MIB).unwrap().start(), 0);
        assert!(registry.first_at_or_after(40 * MIB).is_none());
    }

    #[test]
    fn test_ordered_iteration() {
        let registry = BlockGroupRegistry::new();
        for g in groups(&[30 * MIB, 0, 10 * MIB]) {
            registry.insert(g).unwrap();
        }
        assert_eq!(
            registry.groups().iter().map(|g| g.start()).collect_vec(),
            vec![0, 10 * MIB, 30 * MIB]
        );

        let first = registry.first_at_or_after(0).unwrap();
        let second = registry.next(&first).unwrap();
        let third = registry.next(&second).unwrap();
        assert_eq!(third.start(), 30 * MIB);
        assert!(registry.next(&third).is_none());
    }

    #[test]
    fn test_remove_only_same_group() {
        let registry = BlockGroupRegistry::new();
        let gs = groups(&[0]);
        let other = groups(&[0]);
        registry.insert(gs[0].clone()).unwrap();

        assert!(!registry.remove(&other[0]));
        assert!(registry.remove(&gs[0]));
        assert!(registry.lookup(0).is_none());
        assert!(registry.is_empty());
    }
}
