// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

/// Decides when a queue's pending window becomes a batch.
///
/// A batch is released when it is full (`queue_depth >= max_size`) or when
/// it is stale (the oldest queued job has waited at least `max_wait`),
/// whichever comes first. The staleness half bounds user-visible latency
/// under low throughput: a lone job must not wait indefinitely for enough
/// peers to fill a batch.
///
/// The decision is pure; the caller supplies the queue depth, the window
/// start (the admission timestamp of the head job) and the current time,
/// all in unix millis.
#[derive(Clone, Copy, Debug)]
pub struct BatchingPolicy {
    max_size: usize,
    max_wait: Option<Duration>,
}

impl BatchingPolicy {
    /// A policy that cuts on fullness or staleness.
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            max_size,
            max_wait: Some(max_wait),
        }
    }

    /// A policy that only ever cuts full batches.
    ///
    /// Used by the subtree updater, whose update proofs exist only for
    /// full batches; staleness is handled there by padding the window
    /// with zeros until it is full.
    pub fn full_only(max_size: usize) -> Self {
        Self {
            max_size,
            max_wait: None,
        }
    }

    /// The maximum number of jobs per batch.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The staleness window, if this policy has one.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    /// Whether the pending window should be cut into a batch now.
    ///
    /// An empty queue never cuts, and a queue with no started window
    /// (`window_start` is `None`) is never stale.
    pub fn should_cut(
        &self,
        queue_depth: usize,
        window_start: Option<u64>,
        now: u64,
    ) -> bool {
        if queue_depth == 0 {
            return false;
        }
        if queue_depth >= self.max_size {
            return true;
        }
        match (self.max_wait, window_start) {
            (Some(max_wait), Some(start)) => {
                now.saturating_sub(start) >= max_wait.as_millis() as u64
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_full_window_cuts_immediately() {
        let policy = BatchingPolicy::new(8, Duration::from_secs(15));
        assert!(policy.should_cut(8, Some(1_000), 1_000));
        assert!(policy.should_cut(9, Some(1_000), 1_000));
        assert!(!policy.should_cut(7, Some(1_000), 1_000));
    }

    #[test]
    fn a_stale_window_cuts_at_the_deadline_not_before() {
        let policy = BatchingPolicy::new(8, Duration::from_secs(15));
        let start = 10_000u64;
        assert!(!policy.should_cut(1, Some(start), start + 14_999));
        assert!(policy.should_cut(1, Some(start), start + 15_000));
        assert!(policy.should_cut(1, Some(start), start + 60_000));
    }

    #[test]
    fn an_empty_queue_never_cuts() {
        let policy = BatchingPolicy::new(8, Duration::from_secs(15));
        assert!(!policy.should_cut(0, None, u64::MAX));
        // no started window means not stale, whatever the clock says.
        assert!(!policy.should_cut(1, None, u64::MAX));
    }

    #[test]
    fn full_only_policies_ignore_staleness() {
        let policy = BatchingPolicy::full_only(16);
        assert!(!policy.should_cut(15, Some(0), u64::MAX));
        assert!(policy.should_cut(16, Some(0), 0));
    }
}
