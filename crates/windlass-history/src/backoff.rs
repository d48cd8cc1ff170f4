// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic retry with exponential backoff.
//!
//! [`retry`] is parameterized by the operation and a classifier deciding
//! which errors are worth another attempt; everything else is terminal and
//! surfaced to the caller unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Multiplier applied per attempt.
    pub backoff_coefficient: f64,
    /// Delay ceiling.
    pub maximum_interval: Duration,
    /// Total attempts, including the first.
    pub maximum_attempts: usize,
}

impl RetryPolicy {
    /// Policy used around persistence operations.
    pub fn persistence() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(2),
            maximum_attempts: 5,
        }
    }

    /// Policy with a caller-chosen attempt budget.
    pub fn with_maximum_attempts(maximum_attempts: usize) -> Self {
        Self {
            maximum_attempts,
            ..Self::persistence()
        }
    }

    /// Delay before the attempt following `completed_attempts`, jittered.
    pub fn delay(&self, completed_attempts: usize) -> Duration {
        let exponent = completed_attempts.saturating_sub(1) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.maximum_interval.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Run `op` until it succeeds, the classifier rejects the error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub async fn retry<T, E, Op, Fut, Retryable>(
    policy: &RetryPolicy,
    mut op: Op,
    is_retryable: Retryable,
) -> std::result::Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    Retryable: Fn(&E) -> bool,
{
    let mut attempts = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if attempts >= policy.maximum_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay(attempts)).await;
            }
        }
    }
}
