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

//! Retry policies for transient failures.
//!
//! Every retry bound in the relayer is expressed as an attempt count
//! (`max_retries` on sessions, bounded handler redelivery), while the stock
//! [`backoff::ExponentialBackoff`] gives up on elapsed time. This policy
//! keeps the exponential growth but counts attempts instead, so a caller
//! exhausting it surfaces the underlying error after a known number of
//! tries.

use std::time::Duration;

use backoff::backoff::Backoff;

const DEFAULT_CAP: Duration = Duration::from_secs(10);

/// Exponential backoff that gives up after a fixed number of retries.
///
/// The wait starts at `initial`, doubles on every retry and saturates at
/// the cap. Once `max_retries` attempts are spent, [`Backoff::next_backoff`]
/// returns `None` and the caller must surface the error.
#[derive(Debug, Clone)]
pub struct BoundedExponential {
    next: Duration,
    initial: Duration,
    cap: Duration,
    retries_left: usize,
    max_retries: usize,
}

impl BoundedExponential {
    /// A policy starting at `initial`, doubling up to a 10 s cap, spending
    /// at most `max_retries` attempts.
    pub fn new(initial: Duration, max_retries: usize) -> Self {
        Self::with_cap(initial, DEFAULT_CAP, max_retries)
    }

    /// Same as [`BoundedExponential::new`] with an explicit saturation cap.
    pub fn with_cap(
        initial: Duration,
        cap: Duration,
        max_retries: usize,
    ) -> Self {
        Self {
            next: initial,
            initial,
            cap,
            retries_left: max_retries,
            max_retries,
        }
    }
}

impl Backoff for BoundedExponential {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        let wait = self.next;
        self.next = (self.next * 2).min(self.cap);
        Some(wait)
    }

    fn reset(&mut self) {
        self.next = self.initial;
        self.retries_left = self.max_retries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let mut backoff = BoundedExponential::with_cap(
            Duration::from_millis(100),
            Duration::from_millis(350),
            4,
        );
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        // saturates at the cap instead of reaching 400ms
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
    }

    #[test]
    fn exhausts_after_max_retries() {
        let mut backoff =
            BoundedExponential::new(Duration::from_millis(10), 2);
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert_eq!(backoff.next_backoff(), None);
        // and stays exhausted
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn reset_restores_the_full_budget() {
        let mut backoff =
            BoundedExponential::new(Duration::from_millis(10), 1);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_backoff(), None);
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(10)));
    }
}
