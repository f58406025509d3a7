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

/// Use `debug_assert!` by default. Use `assert!` when feature "strict_assertions" is enabled.
#[macro_export]
macro_rules! strict_assert {
    ($($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        assert!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert!($($arg)*);
    }
}

/// Use `debug_assert_eq!` by default. Use `assert_eq!` when feature "strict_assertions" is enabled.
#[macro_export]
macro_rules! strict_assert_eq {
    ($($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        assert_eq!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert_eq!($($arg)*);
    }
}

/// Use `debug_assert_ne!` by default. Use `assert_ne!` when feature "strict_assertions" is enabled.
#[macro_export]
macro_rules! strict_assert_ne {
    ($($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        assert_ne!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert_ne!($($arg)*);
    }
}

/// Subtract `$val` from an unsigned accounting counter.
///
/// An underflow is an accounting bug. It asserts in debug or strict builds, and otherwise logs and clamps the
/// counter to zero so the accounting keeps making progress.
#[macro_export]
macro_rules! sub_counter {
    ($counter:expr, $val:expr, $name:literal) => {{
        let val: u64 = $val;
        match $counter.checked_sub(val) {
            Some(v) => $counter = v,
            None => {
                $crate::strict_assert!(false, "{} underflow: {} - {}", $name, $counter, val);
                $crate::__tracing::warn!(counter = $name, current = $counter, sub = val, "[accounting]: counter underflow");
                $counter = 0;
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_sub_counter() {
        let mut c = 10u64;
        crate::sub_counter!(c, 4, "test");
        assert_eq!(c, 6);
    }
}
