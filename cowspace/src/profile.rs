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

use std::fmt::Display;

use bitflags::bitflags;
use cowspace_common::units::{KIB, MIB};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Content type and redundancy flags of a block group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BlockGroupFlags: u64 {
        /// File data.
        const DATA = 1 << 0;
        /// Chunk layout metadata.
        const SYSTEM = 1 << 1;
        /// Tree metadata.
        const METADATA = 1 << 2;
        /// Striped.
        const RAID0 = 1 << 3;
        /// Two-way mirror across devices.
        const RAID1 = 1 << 4;
        /// Two copies on the same device.
        const DUP = 1 << 5;
        /// Striped mirrors.
        const RAID10 = 1 << 6;
        /// Single parity.
        const RAID5 = 1 << 7;
        /// Double parity.
        const RAID6 = 1 << 8;
        /// Three-way mirror.
        const RAID1C3 = 1 << 9;
        /// Four-way mirror.
        const RAID1C4 = 1 << 10;

        /// All content type bits.
        const TYPE_MASK = Self::DATA.bits() | Self::SYSTEM.bits() | Self::METADATA.bits();
        /// All redundancy bits.
        const PROFILE_MASK = Self::RAID0.bits()
            | Self::RAID1.bits()
            | Self::DUP.bits()
            | Self::RAID10.bits()
            | Self::RAID5.bits()
            | Self::RAID6.bits()
            | Self::RAID1C3.bits()
            | Self::RAID1C4.bits();
    }
}

impl BlockGroupFlags {
    /// Content type bits only.
    pub fn type_bits(self) -> Self {
        self & Self::TYPE_MASK
    }

    /// The redundancy profile encoded in the flags.
    pub fn profile(self) -> RaidProfile {
        RaidProfile::from_flags(self)
    }

    /// Replace the redundancy bits with `profile`.
    pub fn with_profile(self, profile: RaidProfile) -> Self {
        self.type_bits() | profile.flag()
    }

    /// Whether the group holds file data only.
    pub fn is_data_only(self) -> bool {
        self.type_bits() == Self::DATA
    }

    /// Whether the group mixes data and metadata.
    pub fn is_mixed(self) -> bool {
        self.contains(Self::DATA | Self::METADATA)
    }
}

/// Content class of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentClass {
    /// File data.
    Data,
    /// Tree metadata.
    Metadata,
    /// Chunk layout metadata.
    System,
}

impl ContentClass {
    /// All content classes.
    pub const ALL: [ContentClass; 3] = [ContentClass::Data, ContentClass::Metadata, ContentClass::System];

    /// Index of the class, used for per-class tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The content type flag of the class.
    pub fn flag(self) -> BlockGroupFlags {
        match self {
            ContentClass::Data => BlockGroupFlags::DATA,
            ContentClass::Metadata => BlockGroupFlags::METADATA,
            ContentClass::System => BlockGroupFlags::SYSTEM,
        }
    }

    /// Content class of the given flags. Mixed groups report [`ContentClass::Data`].
    pub fn of(flags: BlockGroupFlags) -> Self {
        if flags.contains(BlockGroupFlags::DATA) {
            ContentClass::Data
        } else if flags.contains(BlockGroupFlags::SYSTEM) {
            ContentClass::System
        } else {
            ContentClass::Metadata
        }
    }
}

impl Display for ContentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentClass::Data => write!(f, "data"),
            ContentClass::Metadata => write!(f, "metadata"),
            ContentClass::System => write!(f, "system"),
        }
    }
}

/// How content classes map to space infos.
///
/// Chosen once when the space manager is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpaceLayout {
    /// Data, metadata and system each own a space info.
    #[default]
    Split,
    /// Data and metadata share one space info and one set of block groups.
    Mixed,
}

impl SpaceLayout {
    /// Content type flags of the space info that serves `class`.
    pub fn space_flags(self, class: ContentClass) -> BlockGroupFlags {
        match (self, class) {
            (SpaceLayout::Mixed, ContentClass::Data | ContentClass::Metadata) => {
                BlockGroupFlags::DATA | BlockGroupFlags::METADATA
            }
            (_, class) => class.flag(),
        }
    }
}

/// Static attributes of a redundancy profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidAttr {
    /// Minimum number of devices to build a chunk.
    pub devs_min: usize,
    /// Maximum number of devices a chunk spans, 0 for unlimited.
    pub devs_max: usize,
    /// Number of copies of each byte.
    pub ncopies: usize,
    /// Number of parity stripes.
    pub nparity: usize,
    /// Human readable name.
    pub name: &'static str,
}

#[rustfmt::skip]
const RAID_ATTRS: [RaidAttr; RaidProfile::COUNT] = [
    RaidAttr { devs_min: 1, devs_max: 1, ncopies: 1, nparity: 0, name: "single" },
    RaidAttr { devs_min: 2, devs_max: 0, ncopies: 1, nparity: 0, name: "raid0" },
    RaidAttr { devs_min: 2, devs_max: 2, ncopies: 2, nparity: 0, name: "raid1" },
    RaidAttr { devs_min: 1, devs_max: 1, ncopies: 2, nparity: 0, name: "dup" },
    RaidAttr { devs_min: 4, devs_max: 0, ncopies: 2, nparity: 0, name: "raid10" },
    RaidAttr { devs_min: 2, devs_max: 0, ncopies: 1, nparity: 1, name: "raid5" },
    RaidAttr { devs_min: 3, devs_max: 0, ncopies: 1, nparity: 2, name: "raid6" },
    RaidAttr { devs_min: 3, devs_max: 3, ncopies: 3, nparity: 0, name: "raid1c3" },
    RaidAttr { devs_min: 4, devs_max: 4, ncopies: 4, nparity: 0, name: "raid1c4" },
];

/// Redundancy and striping scheme of a block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RaidProfile {
    /// One copy on one device.
    Single,
    /// Striped, no redundancy.
    Raid0,
    /// Two-way mirror across devices.
    Raid1,
    /// Two copies on the same device.
    Dup,
    /// Striped mirrors.
    Raid10,
    /// Single parity.
    Raid5,
    /// Double parity.
    Raid6,
    /// Three-way mirror.
    Raid1C3,
    /// Four-way mirror.
    Raid1C4,
}

impl RaidProfile {
    /// Number of profiles.
    pub const COUNT: usize = 9;

    /// All profiles in index order.
    pub const ALL: [RaidProfile; RaidProfile::COUNT] = [
        RaidProfile::Single,
        RaidProfile::Raid0,
        RaidProfile::Raid1,
        RaidProfile::Dup,
        RaidProfile::Raid10,
        RaidProfile::Raid5,
        RaidProfile::Raid6,
        RaidProfile::Raid1C3,
        RaidProfile::Raid1C4,
    ];

    /// Index of the profile, used for per-profile member lists.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Static attributes of the profile.
    pub fn attr(self) -> &'static RaidAttr {
        &RAID_ATTRS[self.index()]
    }

    /// Disk usage factor: bytes written to devices per logical byte.
    pub fn factor(self) -> u64 {
        self.attr().ncopies as u64
    }

    /// The redundancy flag of the profile. [`RaidProfile::Single`] has none.
    pub fn flag(self) -> BlockGroupFlags {
        match self {
            RaidProfile::Single => BlockGroupFlags::empty(),
            RaidProfile::Raid0 => BlockGroupFlags::RAID0,
            RaidProfile::Raid1 => BlockGroupFlags::RAID1,
            RaidProfile::Dup => BlockGroupFlags::DUP,
            RaidProfile::Raid10 => BlockGroupFlags::RAID10,
            RaidProfile::Raid5 => BlockGroupFlags::RAID5,
            RaidProfile::Raid6 => BlockGroupFlags::RAID6,
            RaidProfile::Raid1C3 => BlockGroupFlags::RAID1C3,
            RaidProfile::Raid1C4 => BlockGroupFlags::RAID1C4,
        }
    }

    /// Decode the redundancy profile from block group flags.
    pub fn from_flags(flags: BlockGroupFlags) -> Self {
        RaidProfile::ALL
            .into_iter()
            .skip(1)
            .find(|p| flags.contains(p.flag()))
            .unwrap_or(RaidProfile::Single)
    }
}

impl Display for RaidProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.attr().name)
    }
}

bitflags! {
    /// A set of redundancy profiles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProfileSet: u16 {
        /// [`RaidProfile::Single`].
        const SINGLE = 1 << 0;
        /// [`RaidProfile::Raid0`].
        const RAID0 = 1 << 1;
        /// [`RaidProfile::Raid1`].
        const RAID1 = 1 << 2;
        /// [`RaidProfile::Dup`].
        const DUP = 1 << 3;
        /// [`RaidProfile::Raid10`].
        const RAID10 = 1 << 4;
        /// [`RaidProfile::Raid5`].
        const RAID5 = 1 << 5;
        /// [`RaidProfile::Raid6`].
        const RAID6 = 1 << 6;
        /// [`RaidProfile::Raid1C3`].
        const RAID1C3 = 1 << 7;
        /// [`RaidProfile::Raid1C4`].
        const RAID1C4 = 1 << 8;
    }
}

impl From<RaidProfile> for ProfileSet {
    fn from(profile: RaidProfile) -> Self {
        ProfileSet::from_bits_truncate(1 << profile.index())
    }
}

impl FromIterator<RaidProfile> for ProfileSet {
    fn from_iter<T: IntoIterator<Item = RaidProfile>>(iter: T) -> Self {
        iter.into_iter().fold(ProfileSet::empty(), |set, p| set | p.into())
    }
}

impl ProfileSet {
    /// Whether the set contains `profile`.
    pub fn has(self, profile: RaidProfile) -> bool {
        self.contains(profile.into())
    }

    /// Iterate profiles in the set, in index order.
    pub fn profiles(self) -> impl Iterator<Item = RaidProfile> {
        RaidProfile::ALL.into_iter().filter(move |p| self.has(*p))
    }
}

/// Coarse allocation size bucket of a data block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SizeClass {
    /// Untyped, accepts any size.
    #[default]
    None,
    /// Allocations up to 128 KiB.
    Small,
    /// Allocations up to 8 MiB.
    Medium,
    /// Larger allocations.
    Large,
}

impl SizeClass {
    /// Size class of an allocation of `size` bytes.
    pub fn of(size: u64) -> Self {
        if size <= 128 * KIB {
            SizeClass::Small
        } else if size <= 8 * MIB {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_profile_roundtrip() {
        for profile in RaidProfile::ALL {
            let flags = BlockGroupFlags::DATA.with_profile(profile);
            assert_eq!(flags.profile(), profile);
            assert_eq!(flags.type_bits(), BlockGroupFlags::DATA);
        }
        assert_eq!(BlockGroupFlags::METADATA.profile(), RaidProfile::Single);
    }

    #[test]
    fn test_attr_table_matches_profiles() {
        for profile in RaidProfile::ALL {
            assert_eq!(profile.attr().name, format!("{profile:?}").to_lowercase());
        }
        let devs_min = RaidProfile::ALL.map(|p| p.attr().devs_min);
        assert_eq!(devs_min, [1, 2, 2, 1, 4, 2, 3, 3, 4]);
        let factors = RaidProfile::ALL.map(|p| p.factor());
        assert_eq!(factors, [1, 1, 2, 2, 2, 1, 1, 3, 4]);
    }

    #[test]
    fn test_mixed_layout() {
        let mixed = SpaceLayout::Mixed;
        assert_eq!(mixed.space_flags(ContentClass::Data), mixed.space_flags(ContentClass::Metadata));
        assert!(mixed.space_flags(ContentClass::Data).is_mixed());
        assert_eq!(mixed.space_flags(ContentClass::System), BlockGroupFlags::SYSTEM);
        assert_eq!(SpaceLayout::Split.space_flags(ContentClass::Data), BlockGroupFlags::DATA);
        assert!(!(BlockGroupFlags::DATA | BlockGroupFlags::METADATA).is_data_only());
    }

    #[test]
    fn test_profile_set() {
        let set: ProfileSet = [RaidProfile::Raid1, RaidProfile::Raid0].into_iter().collect();
        assert!(set.has(RaidProfile::Raid1));
        assert!(!set.has(RaidProfile::Single));
        assert_eq!(set.profiles().collect::<Vec<_>>(), vec![RaidProfile::Raid0, RaidProfile::Raid1]);
    }

    #[test]
    fn test_size_class() {
        assert_eq!(SizeClass::of(4 * KIB), SizeClass::Small);
        assert_eq!(SizeClass::of(128 * KIB), SizeClass::Small);
        assert_eq!(SizeClass::of(128 * KIB + 1), SizeClass::Medium);
        assert_eq!(SizeClass::of(8 * MIB), SizeClass::Medium);
        assert_eq!(SizeClass::of(8 * MIB + 1), SizeClass::Large);
    }
}
