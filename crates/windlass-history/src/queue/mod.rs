// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue processor plumbing shared by the transfer and timer loops.
//!
//! Ack managers track outstanding tasks and advance the ack level to the
//! contiguous-prefix maximum: a crash replays only tasks at or beyond the
//! last durable ack. The token bucket paces store polling.

pub mod timer;
pub mod transfer;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Token bucket pacing store polls; single-consumer, owned by one loop.
pub(crate) struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64,
}

impl TokenBucket {
    pub(crate) fn new(rate_per_second: u32) -> Self {
        let rate = f64::from(rate_per_second.max(1));
        Self {
            tokens: rate,
            last_refill: Instant::now(),
            max_tokens: rate,
            refill_rate: rate,
        }
    }

    /// Take one token; returns how long to wait before proceeding.
    pub(crate) fn acquire(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }
}

/// Contiguous-prefix ack tracking for transfer tasks.
pub(crate) struct TaskAckManager {
    outstanding: BTreeMap<i64, bool>,
    ack_level: i64,
}

impl TaskAckManager {
    pub(crate) fn new(ack_level: i64) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            ack_level,
        }
    }

    pub(crate) fn level(&self) -> i64 {
        self.ack_level
    }

    /// Track a task read from the queue.
    pub(crate) fn begin(&mut self, task_id: i64) {
        if task_id > self.ack_level {
            self.outstanding.entry(task_id).or_insert(false);
        }
    }

    /// Mark a task fully processed.
    pub(crate) fn complete(&mut self, task_id: i64) {
        if let Some(done) = self.outstanding.get_mut(&task_id) {
            *done = true;
        }
    }

    /// Advance the ack level over the completed prefix and return it.
    pub(crate) fn advance(&mut self) -> i64 {
        while let Some((&task_id, &done)) = self.outstanding.first_key_value() {
            if !done {
                break;
            }
            self.outstanding.remove(&task_id);
            self.ack_level = task_id;
        }
        self.ack_level
    }
}

/// Contiguous-prefix ack tracking for timer tasks, keyed by
/// `(visibility_time, task_id)`.
pub(crate) struct TimerAckManager {
    outstanding: BTreeMap<(DateTime<Utc>, i64), bool>,
    ack_level: DateTime<Utc>,
}

impl TimerAckManager {
    pub(crate) fn new(ack_level: DateTime<Utc>) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            ack_level,
        }
    }

    pub(crate) fn level(&self) -> DateTime<Utc> {
        self.ack_level
    }

    pub(crate) fn begin(&mut self, visibility_time: DateTime<Utc>, task_id: i64) {
        self.outstanding
            .entry((visibility_time, task_id))
            .or_insert(false);
    }

    pub(crate) fn complete(&mut self, visibility_time: DateTime<Utc>, task_id: i64) {
        if let Some(done) = self.outstanding.get_mut(&(visibility_time, task_id)) {
            *done = true;
        }
    }

    /// Advance the ack level over the completed prefix and return it.
    pub(crate) fn advance(&mut self) -> DateTime<Utc> {
        while let Some((&(visibility_time, _), &done)) = self.outstanding.first_key_value() {
            if !done {
                break;
            }
            self.outstanding.pop_first();
            if visibility_time > self.ack_level {
                self.ack_level = visibility_time;
            }
        }
        self.ack_level
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn ack_advances_only_over_contiguous_prefix() {
        let mut ack = TaskAckManager::new(10);
        ack.begin(11);
        ack.begin(12);
        ack.begin(13);

        // Out-of-order completion: 13 done, 11 not.
        ack.complete(13);
        assert_eq!(ack.advance(), 10);

        ack.complete(11);
        assert_eq!(ack.advance(), 11);

        ack.complete(12);
        assert_eq!(ack.advance(), 13);
    }

    #[test]
    fn ack_level_is_non_decreasing() {
        let mut ack = TaskAckManager::new(5);
        ack.begin(3); // below level, ignored
        assert_eq!(ack.advance(), 5);
        ack.begin(6);
        ack.complete(6);
        assert_eq!(ack.advance(), 6);
        assert_eq!(ack.advance(), 6);
    }

    #[test]
    fn timer_ack_orders_by_time_then_id() {
        let base = Utc::now();
        let mut ack = TimerAckManager::new(base);
        let t1 = base + TimeDelta::seconds(1);
        let t2 = base + TimeDelta::seconds(2);

        ack.begin(t1, 100);
        ack.begin(t1, 101);
        ack.begin(t2, 102);

        ack.complete(t1, 101);
        ack.complete(t2, 102);
        assert_eq!(ack.advance(), base);

        ack.complete(t1, 100);
        assert_eq!(ack.advance(), t2);
    }

    #[test]
    fn token_bucket_allows_burst_then_paces() {
        let mut bucket = TokenBucket::new(100);
        let mut immediate = 0;
        for _ in 0..100 {
            if bucket.acquire().is_zero() {
                immediate += 1;
            }
        }
        assert_eq!(immediate, 100);
        assert!(!bucket.acquire().is_zero());
    }
}
