// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded fixed-interval polling.
//!
//! Readiness waits are modeled as a [`RetryPolicy`] value plus a check
//! closure, instead of loops with embedded sleeps, so the bounds are
//! testable without real time passing (tokio's paused test clock).

use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, max_attempts: usize) -> RetryPolicy {
        RetryPolicy { interval, max_attempts }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    Pending,
}

#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("condition not met after {attempts} attempts over {waited:?}")]
pub struct PollTimeout {
    pub attempts: usize,
    pub waited: Duration,
}

/// Calls `check` up to `policy.max_attempts` times, sleeping
/// `policy.interval` between attempts, until it reports
/// [`PollOutcome::Ready`]. The attempt number (starting at 1) is passed to
/// `check`.
pub async fn poll_until<T, F, Fut>(
    policy: &RetryPolicy,
    mut check: F,
) -> Result<T, PollTimeout>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = PollOutcome<T>>,
{
    let start = tokio::time::Instant::now();
    for attempt in 1..=policy.max_attempts {
        if let PollOutcome::Ready(value) = check(attempt).await {
            return Ok(value);
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(PollTimeout {
        attempts: policy.max_attempts,
        waited: start.elapsed(),
    })
}
