// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History service configuration.

use std::time::Duration;

/// Tuning knobs for the history service.
///
/// Loaded from `WINDLASS_*` environment variables with defaults suitable for
/// a single-host deployment. `number_of_shards` and `range_size_bits` are
/// cluster-creation-time choices: changing them on an existing cluster
/// corrupts task-id allocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed shard count, chosen at cluster creation.
    pub number_of_shards: u32,
    /// Bits of task-id space per range; ids under range `r` come from
    /// `[r << bits, (r + 1) << bits)`.
    pub range_size_bits: u8,
    /// Initial allocation hint for the execution cache.
    pub history_cache_initial_size: usize,
    /// Execution cache capacity.
    pub history_cache_max_size: usize,
    /// Execution cache entry time-to-live.
    pub history_cache_ttl: Duration,
    /// How often the controller tries to acquire missing shards.
    pub acquire_shard_interval: Duration,
    /// Max timer tasks read per poll.
    pub timer_task_batch_size: usize,
    /// Timer task worker pool size per shard.
    pub process_timer_task_worker_count: usize,
    /// How often the timer ack level is flushed to the shard row.
    pub timer_processor_update_ack_interval: Duration,
    /// Idle wait between timer polls when no timer is due sooner.
    pub timer_processor_max_poll_interval: Duration,
    /// Retry budget for timer task reads.
    pub timer_processor_get_failure_retry_count: usize,
    /// Retry budget for timer ack updates.
    pub timer_processor_update_failure_retry_count: usize,
    /// Max transfer tasks read per poll.
    pub transfer_task_batch_size: usize,
    /// Transfer task worker pool size per shard.
    pub transfer_task_worker_count: usize,
    /// Token-bucket ceiling on transfer queue polls per second.
    pub transfer_processor_max_poll_rps: u32,
    /// Idle wait between transfer polls when nothing is queued.
    pub transfer_processor_max_poll_interval: Duration,
    /// How often the transfer ack level is flushed to the shard row.
    pub transfer_processor_update_ack_interval: Duration,
    /// Default activity schedule-to-close timeout when a decision passes 0.
    pub default_activity_schedule_to_close_timeout_seconds: i32,
    /// Default activity schedule-to-start timeout when a decision passes 0.
    pub default_activity_schedule_to_start_timeout_seconds: i32,
    /// Default activity start-to-close timeout when a decision passes 0.
    pub default_activity_start_to_close_timeout_seconds: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            number_of_shards: 4,
            range_size_bits: 20,
            history_cache_initial_size: 128,
            history_cache_max_size: 512,
            history_cache_ttl: Duration::from_secs(3600),
            acquire_shard_interval: Duration::from_secs(60),
            timer_task_batch_size: 100,
            process_timer_task_worker_count: 10,
            timer_processor_update_ack_interval: Duration::from_secs(10),
            timer_processor_max_poll_interval: Duration::from_secs(10),
            timer_processor_get_failure_retry_count: 5,
            timer_processor_update_failure_retry_count: 5,
            transfer_task_batch_size: 10,
            transfer_task_worker_count: 10,
            transfer_processor_max_poll_rps: 100,
            transfer_processor_max_poll_interval: Duration::from_secs(10),
            transfer_processor_update_ack_interval: Duration::from_secs(10),
            default_activity_schedule_to_close_timeout_seconds: 600,
            default_activity_schedule_to_start_timeout_seconds: 60,
            default_activity_start_to_close_timeout_seconds: 300,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `WINDLASS_NUMBER_OF_SHARDS`: shard count (default: 4)
    /// - `WINDLASS_RANGE_SIZE_BITS`: task-id bits per range (default: 20)
    /// - `WINDLASS_HISTORY_CACHE_MAX_SIZE`: execution cache capacity (default: 512)
    /// - `WINDLASS_HISTORY_CACHE_TTL_SECS`: cache entry TTL (default: 3600)
    /// - `WINDLASS_ACQUIRE_SHARD_INTERVAL_SECS`: acquisition retry interval (default: 60)
    /// - `WINDLASS_TIMER_TASK_BATCH_SIZE`: timer read batch (default: 100)
    /// - `WINDLASS_TIMER_TASK_WORKER_COUNT`: timer workers per shard (default: 10)
    /// - `WINDLASS_TRANSFER_TASK_BATCH_SIZE`: transfer read batch (default: 10)
    /// - `WINDLASS_TRANSFER_TASK_WORKER_COUNT`: transfer workers per shard (default: 10)
    /// - `WINDLASS_TRANSFER_MAX_POLL_RPS`: transfer poll rate limit (default: 100)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            number_of_shards: env_parse("WINDLASS_NUMBER_OF_SHARDS", default.number_of_shards),
            range_size_bits: env_parse("WINDLASS_RANGE_SIZE_BITS", default.range_size_bits),
            history_cache_initial_size: env_parse(
                "WINDLASS_HISTORY_CACHE_INITIAL_SIZE",
                default.history_cache_initial_size,
            ),
            history_cache_max_size: env_parse(
                "WINDLASS_HISTORY_CACHE_MAX_SIZE",
                default.history_cache_max_size,
            ),
            history_cache_ttl: env_secs("WINDLASS_HISTORY_CACHE_TTL_SECS", default.history_cache_ttl),
            acquire_shard_interval: env_secs(
                "WINDLASS_ACQUIRE_SHARD_INTERVAL_SECS",
                default.acquire_shard_interval,
            ),
            timer_task_batch_size: env_parse(
                "WINDLASS_TIMER_TASK_BATCH_SIZE",
                default.timer_task_batch_size,
            ),
            process_timer_task_worker_count: env_parse(
                "WINDLASS_TIMER_TASK_WORKER_COUNT",
                default.process_timer_task_worker_count,
            ),
            timer_processor_update_ack_interval: env_secs(
                "WINDLASS_TIMER_UPDATE_ACK_INTERVAL_SECS",
                default.timer_processor_update_ack_interval,
            ),
            timer_processor_max_poll_interval: env_secs(
                "WINDLASS_TIMER_MAX_POLL_INTERVAL_SECS",
                default.timer_processor_max_poll_interval,
            ),
            timer_processor_get_failure_retry_count: env_parse(
                "WINDLASS_TIMER_GET_FAILURE_RETRY_COUNT",
                default.timer_processor_get_failure_retry_count,
            ),
            timer_processor_update_failure_retry_count: env_parse(
                "WINDLASS_TIMER_UPDATE_FAILURE_RETRY_COUNT",
                default.timer_processor_update_failure_retry_count,
            ),
            transfer_task_batch_size: env_parse(
                "WINDLASS_TRANSFER_TASK_BATCH_SIZE",
                default.transfer_task_batch_size,
            ),
            transfer_task_worker_count: env_parse(
                "WINDLASS_TRANSFER_TASK_WORKER_COUNT",
                default.transfer_task_worker_count,
            ),
            transfer_processor_max_poll_rps: env_parse(
                "WINDLASS_TRANSFER_MAX_POLL_RPS",
                default.transfer_processor_max_poll_rps,
            ),
            transfer_processor_max_poll_interval: env_secs(
                "WINDLASS_TRANSFER_MAX_POLL_INTERVAL_SECS",
                default.transfer_processor_max_poll_interval,
            ),
            transfer_processor_update_ack_interval: env_secs(
                "WINDLASS_TRANSFER_UPDATE_ACK_INTERVAL_SECS",
                default.transfer_processor_update_ack_interval,
            ),
            default_activity_schedule_to_close_timeout_seconds: env_parse(
                "WINDLASS_DEFAULT_ACTIVITY_SCHEDULE_TO_CLOSE_SECS",
                default.default_activity_schedule_to_close_timeout_seconds,
            ),
            default_activity_schedule_to_start_timeout_seconds: env_parse(
                "WINDLASS_DEFAULT_ACTIVITY_SCHEDULE_TO_START_SECS",
                default.default_activity_schedule_to_start_timeout_seconds,
            ),
            default_activity_start_to_close_timeout_seconds: env_parse(
                "WINDLASS_DEFAULT_ACTIVITY_START_TO_CLOSE_SECS",
                default.default_activity_start_to_close_timeout_seconds,
            ),
        }
    }

    /// Configuration with short intervals for tests.
    pub fn fast_for_tests() -> Self {
        Self {
            acquire_shard_interval: Duration::from_millis(50),
            timer_processor_update_ack_interval: Duration::from_millis(50),
            timer_processor_max_poll_interval: Duration::from_millis(50),
            transfer_processor_max_poll_interval: Duration::from_millis(50),
            transfer_processor_update_ack_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.range_size_bits, 20);
        assert!(config.number_of_shards > 0);
        assert!(config.transfer_task_worker_count > 0);
        assert!(config.history_cache_max_size > 0);
    }
}
