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

//! Shared components and utils for cowspace.

/// Allow enable debug assertions in release profile with feature "strict_assertion".
pub mod assert;
/// Drainable in-flight counters.
pub mod counter;
/// The error type of cowspace.
pub mod error;
/// The metrics model of cowspace.
pub mod metrics;
/// Runtime wrappers used by background work.
pub mod runtime;
/// Size units and byte arithmetic.
pub mod units;

#[doc(hidden)]
pub use tracing as __tracing;
