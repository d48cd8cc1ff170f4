// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine counters.
//!
//! Plain atomic counters surfaced through the service handle and logged by
//! the processors; scraping and export belong to the embedding service.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for one history service.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Shards acquired by this host.
    pub shards_acquired: AtomicU64,
    /// Shards unloaded after ownership loss or shutdown.
    pub shards_unloaded: AtomicU64,
    /// Writes rejected because the shard lease was lost.
    pub ownership_lost: AtomicU64,
    /// Update transactions that hit an optimistic-concurrency conflict.
    pub update_conflicts: AtomicU64,
    /// Transfer tasks dispatched successfully.
    pub transfer_tasks_dispatched: AtomicU64,
    /// Transfer task dispatch failures (task is retried, never dropped).
    pub transfer_task_failures: AtomicU64,
    /// Timer tasks fired successfully.
    pub timer_tasks_fired: AtomicU64,
    /// Timer task failures (task is retried, never dropped).
    pub timer_task_failures: AtomicU64,
}

impl EngineMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            shards_acquired: self.shards_acquired.load(Ordering::Relaxed),
            shards_unloaded: self.shards_unloaded.load(Ordering::Relaxed),
            ownership_lost: self.ownership_lost.load(Ordering::Relaxed),
            update_conflicts: self.update_conflicts.load(Ordering::Relaxed),
            transfer_tasks_dispatched: self.transfer_tasks_dispatched.load(Ordering::Relaxed),
            transfer_task_failures: self.transfer_task_failures.load(Ordering::Relaxed),
            timer_tasks_fired: self.timer_tasks_fired.load(Ordering::Relaxed),
            timer_task_failures: self.timer_task_failures.load(Ordering::Relaxed),
        }
    }
}

/// Increment an [`EngineMetrics`] counter.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Shards acquired by this host.
    pub shards_acquired: u64,
    /// Shards unloaded after ownership loss or shutdown.
    pub shards_unloaded: u64,
    /// Writes rejected because the shard lease was lost.
    pub ownership_lost: u64,
    /// Update transactions that hit an optimistic-concurrency conflict.
    pub update_conflicts: u64,
    /// Transfer tasks dispatched successfully.
    pub transfer_tasks_dispatched: u64,
    /// Transfer task dispatch failures.
    pub transfer_task_failures: u64,
    /// Timer tasks fired successfully.
    pub timer_tasks_fired: u64,
    /// Timer task failures.
    pub timer_task_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = EngineMetrics::new();
        incr(&metrics.update_conflicts);
        incr(&metrics.update_conflicts);
        incr(&metrics.timer_tasks_fired);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.update_conflicts, 2);
        assert_eq!(snapshot.timer_tasks_fired, 1);
        assert_eq!(snapshot.transfer_task_failures, 0);
    }
}
