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

use tokio::sync::watch;

/// A counter of in-flight operations that can be waited on until it drains to zero.
///
/// Callers are expected to stop new increments (e.g. by marking the owner read-only) before waiting, so the counter
/// is monotonically decreasing while someone waits on it.
#[derive(Debug)]
pub struct InflightCounter {
    tx: watch::Sender<usize>,
}

impl Default for InflightCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightCounter {
    /// Create a zeroed counter.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Increase the counter by one.
    pub fn inc(&self) {
        self.tx.send_modify(|v| *v += 1);
    }

    /// Decrease the counter by one.
    ///
    /// Returns the counter value after the decrement.
    pub fn dec(&self) -> usize {
        let mut res = 0;
        self.tx.send_modify(|v| {
            crate::strict_assert!(*v > 0, "in-flight counter underflow");
            *v = v.saturating_sub(1);
            res = *v;
        });
        res
    }

    /// Get the current value.
    pub fn get(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until the counter reaches zero.
    pub async fn wait_zero(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot be closed while waiting.
        let _ = rx.wait_for(|v| *v == 0).await;
    }
}
