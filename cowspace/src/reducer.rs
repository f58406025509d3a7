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

use crate::profile::{ProfileSet, RaidProfile};

/// Default profile priority, highest redundancy first.
pub const DEFAULT_PROFILE_PRIORITY: [RaidProfile; 8] = [
    RaidProfile::Raid1C4,
    RaidProfile::Raid6,
    RaidProfile::Raid1C3,
    RaidProfile::Raid5,
    RaidProfile::Raid10,
    RaidProfile::Raid1,
    RaidProfile::Dup,
    RaidProfile::Raid0,
];

/// Reduces a set of allowed redundancy profiles to the one profile new chunks are allocated with.
///
/// The priority table is policy, not derived from the profile attributes. Profiles missing from the table are never
/// picked, and [`RaidProfile::Single`] is the fallback when nothing in the table is feasible.
#[derive(Debug, Clone)]
pub struct ProfileReducer {
    priority: Vec<RaidProfile>,
}

impl Default for ProfileReducer {
    fn default() -> Self {
        Self::new(DEFAULT_PROFILE_PRIORITY.to_vec())
    }
}

impl ProfileReducer {
    /// Create a reducer with the given priority table, highest priority first.
    pub fn new(priority: Vec<RaidProfile>) -> Self {
        Self { priority }
    }

    /// The priority table.
    pub fn priority(&self) -> &[RaidProfile] {
        &self.priority
    }

    /// Reduce `allowed` to one profile.
    ///
    /// An active conversion target wins unconditionally. Otherwise profiles that need more devices than
    /// `rw_devices` are masked out and the remaining one with the highest priority is picked.
    pub fn reduce(&self, allowed: ProfileSet, rw_devices: usize, conversion_target: Option<RaidProfile>) -> RaidProfile {
        if let Some(target) = conversion_target {
            return target;
        }

        let feasible: ProfileSet = allowed
            .profiles()
            .filter(|p| p.attr().devs_min <= rw_devices)
            .collect();

        self.priority
            .iter()
            .copied()
            .find(|p| feasible.has(*p))
            .unwrap_or(RaidProfile::Single)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_by_priority() {
        let reducer = ProfileReducer::default();
        let allowed: ProfileSet = [RaidProfile::Raid1, RaidProfile::Raid0, RaidProfile::Raid1C3]
            .into_iter()
            .collect();

        assert_eq!(reducer.reduce(allowed, 4, None), RaidProfile::Raid1C3);
        assert_eq!(reducer.reduce(allowed, 2, None), RaidProfile::Raid1);
    }

    #[test]
    fn test_reduce_single_device() {
        let reducer = ProfileReducer::default();
        let allowed: ProfileSet = [RaidProfile::Raid1, RaidProfile::Raid0].into_iter().collect();
        assert_eq!(reducer.reduce(allowed, 1, None), RaidProfile::Single);

        let allowed: ProfileSet = [RaidProfile::Raid1, RaidProfile::Dup].into_iter().collect();
        assert_eq!(reducer.reduce(allowed, 1, None), RaidProfile::Dup);
    }

    #[test]
    fn test_conversion_target_wins() {
        let reducer = ProfileReducer::default();
        let allowed: ProfileSet = RaidProfile::Raid1C4.into();
        assert_eq!(
            reducer.reduce(allowed, 8, Some(RaidProfile::Raid10)),
            RaidProfile::Raid10
        );
    }

    #[test]
    fn test_custom_priority() {
        let reducer = ProfileReducer::new(vec![RaidProfile::Raid0, RaidProfile::Raid1]);
        let allowed: ProfileSet = [RaidProfile::Raid1, RaidProfile::Raid0].into_iter().collect();
        assert_eq!(reducer.reduce(allowed, 2, None), RaidProfile::Raid0);

        // Not in the table, never picked.
        let allowed: ProfileSet = RaidProfile::Raid6.into();
        assert_eq!(reducer.reduce(allowed, 8, None), RaidProfile::Single);
    }
}
