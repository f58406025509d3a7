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

//! Size units and arithmetic helpers for byte accounting.

/// 1 KiB.
pub const KIB: u64 = 1 << 10;
/// 1 MiB.
pub const MIB: u64 = 1 << 20;
/// 1 GiB.
pub const GIB: u64 = 1 << 30;

/// `num * factor / 100` without intermediate overflow.
pub fn mult_perc(num: u64, factor: u64) -> u64 {
    if factor >= 100 {
        return num;
    }
    ((num as u128 * factor as u128) / 100) as u64
}

/// Align `v` down to a power of two `align`.
pub fn align_down(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    v & !(align - 1)
}

/// Whether `v` is aligned to a power of two `align`.
pub fn is_aligned(v: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    v & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mult_perc() {
        assert_eq!(mult_perc(GIB, 80), 858_993_459);
        assert_eq!(mult_perc(1000, 1), 10);
        assert_eq!(mult_perc(1000, 150), 1000);
        assert_eq!(mult_perc(u64::MAX, 50), u64::MAX / 2);
    }

    #[test]
    fn test_align() {
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8193, 4096));
    }
}
