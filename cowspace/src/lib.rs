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

//! Block group allocation and free space caching for copy-on-write extent filesystems.
//!
//! The logical address space is carved into block groups, each backed by one chunk on the devices and serving one
//! content class: data, metadata or system. A [`SpaceManager`] tracks every group in a per-class [`SpaceInfo`],
//! soft-reserves bytes before an operation and carves extents out of the groups' free space, allocating new chunks
//! when a class runs low. Free space of a group is discovered lazily by a background caching task and released
//! bytes stay pinned until the transaction that freed them commits. Empty and underused groups are removed or
//! relocated by a background reclaim engine.
//!
//! The embedding filesystem provides the extent records, persistence, device layout, transaction hooks and
//! relocation through the [`ExtentSource`], [`PersistentStore`], [`DeviceLayout`], [`TransactionContext`] and
//! [`Relocator`] traits.

mod alloc;
mod block_group;
mod caching;
mod chunk;
mod external;
mod free_space;
mod manager;
mod mount;
mod profile;
mod readonly;
mod reclaim;
mod reducer;
mod registry;
mod space_info;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

mod prelude;
pub use prelude::*;
