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

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

// FIXME: https://github.com/rust-lang/rust-analyzer/issues/17685
// #[expect(missing_docs)]
/// ... ...
#[derive(Debug)]
pub struct Metrics {
    /* reservation metrics */
    /// ... ...
    pub space_reserve: BoxedCounter,
    /// ... ...
    pub space_reserve_wait: BoxedCounter,
    /// ... ...
    pub space_reserve_fail: BoxedCounter,
    /// ... ...
    pub space_reserve_wait_duration: BoxedHistogram,

    /* allocation metrics */
    /// ... ...
    pub space_allocate: BoxedCounter,
    /// ... ...
    pub space_allocate_fail: BoxedCounter,
    /// ... ...
    pub space_commit: BoxedCounter,
    /// ... ...
    pub space_release: BoxedCounter,
    /// ... ...
    pub space_release_pinned: BoxedCounter,
    /// ... ...
    pub space_unpin: BoxedCounter,

    /* chunk allocation metrics */
    /// ... ...
    pub space_chunk_alloc: BoxedCounter,
    /// ... ...
    pub space_chunk_alloc_fail: BoxedCounter,
    /// ... ...
    pub space_chunk_alloc_duration: BoxedHistogram,

    /* read-only metrics */
    /// ... ...
    pub space_set_ro: BoxedCounter,
    /// ... ...
    pub space_clear_ro: BoxedCounter,

    /* caching metrics */
    /// ... ...
    pub space_cache_start: BoxedCounter,
    /// ... ...
    pub space_cache_finish: BoxedCounter,
    /// ... ...
    pub space_cache_error: BoxedCounter,
    /// ... ...
    pub space_caching_duration: BoxedHistogram,

    /* reclaim metrics */
    /// ... ...
    pub space_remove_unused: BoxedCounter,
    /// ... ...
    pub space_relocate: BoxedCounter,
    /// ... ...
    pub space_relocate_fail: BoxedCounter,
    /// ... ...
    pub space_reclaim_pass_duration: BoxedHistogram,

    /// ... ...
    pub space_block_groups: BoxedGauge,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new<R>(name: &'static str, registry: &R) -> Self
    where
        R: RegistryOps,
    {
        let cowspace_op_total = registry.register_counter_vec(
            "cowspace_op_total".into(),
            "cowspace space manager operations".into(),
            &["name", "op"],
        );
        let cowspace_op_duration = registry.register_histogram_vec(
            "cowspace_op_duration".into(),
            "cowspace space manager operation durations".into(),
            &["name", "op"],
        );
        let cowspace_block_groups = registry.register_gauge_vec(
            "cowspace_block_groups".into(),
            "cowspace registered block groups".into(),
            &["name"],
        );

        let op = |op: &'static str| cowspace_op_total.counter(&[name.into(), op.into()]);
        let duration = |op: &'static str| cowspace_op_duration.histogram(&[name.into(), op.into()]);

        Self {
            space_reserve: op("reserve"),
            space_reserve_wait: op("reserve_wait"),
            space_reserve_fail: op("reserve_fail"),
            space_reserve_wait_duration: duration("reserve_wait"),

            space_allocate: op("allocate"),
            space_allocate_fail: op("allocate_fail"),
            space_commit: op("commit"),
            space_release: op("release"),
            space_release_pinned: op("release_pinned"),
            space_unpin: op("unpin"),

            space_chunk_alloc: op("chunk_alloc"),
            space_chunk_alloc_fail: op("chunk_alloc_fail"),
            space_chunk_alloc_duration: duration("chunk_alloc"),

            space_set_ro: op("set_ro"),
            space_clear_ro: op("clear_ro"),

            space_cache_start: op("cache_start"),
            space_cache_finish: op("cache_finish"),
            space_cache_error: op("cache_error"),
            space_caching_duration: duration("caching"),

            space_remove_unused: op("remove_unused"),
            space_relocate: op("relocate"),
            space_relocate_fail: op("relocate_fail"),
            space_reclaim_pass_duration: duration("reclaim_pass"),

            space_block_groups: cowspace_block_groups.gauge(&[name.into()]),
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by tests and other cowspace components.
    #[doc(hidden)]
    pub fn noop() -> Self {
        use super::registry::noop::NoopMetricsRegistry;

        Self::new("test", &NoopMetricsRegistry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::noop::NoopMetricsRegistry;

    fn case(registry: &impl RegistryOps) {
        let _ = Metrics::new("test", registry);
    }

    #[test]
    fn test_metrics_noop() {
        case(&NoopMetricsRegistry);
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_metrics_prometheus() {
        use crate::metrics::registry::prometheus::PrometheusMetricsRegistry;

        case(&PrometheusMetricsRegistry::new(prometheus::Registry::new()));
    }
}
