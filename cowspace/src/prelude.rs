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

pub use cowspace_common::error::{Error, ErrorKind, Result};

pub use crate::{
    block_group::{BlockGroup, BlockGroupRef, BlockGroupStats, CacheState, Extent},
    external::{
        BlockGroupRecord, ChunkLayout, ChunkMapping, DeviceLayout, ExclusiveOp, ExtentSource, PersistentStore,
        Relocator, Stripe, TransactionContext, UsedExtent,
    },
    free_space::FreeSpaceIndex,
    manager::{SpaceManager, SpaceManagerBuildContext, SpaceManagerBuilder, DEFAULT_SUPER_MIRRORS},
    profile::{BlockGroupFlags, ContentClass, ProfileSet, RaidAttr, RaidProfile, SizeClass, SpaceLayout},
    reducer::{ProfileReducer, DEFAULT_PROFILE_PRIORITY},
    space_info::{ChunkAllocForce, FlushMode, SpaceInfo, SpaceInfoStats, SpaceReservation},
};
