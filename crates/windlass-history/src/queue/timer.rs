// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer queue processor.
//!
//! Sleeps until the earliest pending timer is due, reads the batch of ready
//! tasks, fires each through the engine on a bounded worker pool, and
//! advances the timer ack level to the contiguous-prefix-maximum timestamp.
//! Reads and ack flushes retry with bounded backoff; a persistently failing
//! task trips a counter but is never abandoned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use windlass_persistence::{StoreError, TimerTask};

use crate::backoff::{RetryPolicy, retry};
use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::metrics::incr;
use crate::queue::TimerAckManager;

pub(crate) struct TimerQueueProcessor {
    engine: Arc<HistoryEngine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TimerQueueProcessor {
    pub(crate) fn new(engine: Arc<HistoryEngine>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            engine,
            shutdown_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let engine = self.engine.clone();
        let shard = engine.shard.clone();
        let config = engine.config.clone();
        let shard_id = shard.shard_id();

        let get_retry =
            RetryPolicy::with_maximum_attempts(config.timer_processor_get_failure_retry_count.max(1));
        let update_retry = RetryPolicy::with_maximum_attempts(
            config.timer_processor_update_failure_retry_count.max(1),
        );

        let mut ack = TimerAckManager::new(shard.timer_ack_level().await);
        let mut last_flushed_level = ack.level();
        let mut last_flush_at = Instant::now();

        info!(shard_id, "timer queue processor started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            if shard.is_closed().await {
                break;
            }

            let now = Utc::now();
            let min_time = ack.level();
            let tasks = match read_timer_tasks(
                &engine,
                &get_retry,
                min_time,
                now,
                config.timer_task_batch_size,
            )
            .await
            {
                Ok(tasks) => tasks,
                Err(err) => {
                    incr(&engine.metrics.timer_task_failures);
                    warn!(shard_id, error = %err, "timer task read failed");
                    Vec::new()
                }
            };

            if !tasks.is_empty() {
                debug!(shard_id, count = tasks.len(), "firing timer tasks");
                let mut workers: JoinSet<(DateTime<Utc>, i64, Result<()>)> = JoinSet::new();
                for task in tasks {
                    ack.begin(task.visibility_time, task.task_id);
                    while workers.len() >= config.process_timer_task_worker_count {
                        if let Some(joined) = workers.join_next().await {
                            handle_completion(&engine, &mut ack, joined).await;
                        }
                    }
                    let engine = engine.clone();
                    workers.spawn(async move {
                        let key = (task.visibility_time, task.task_id);
                        let result = engine.process_timer_task(&task).await;
                        (key.0, key.1, result)
                    });
                }
                while let Some(joined) = workers.join_next().await {
                    handle_completion(&engine, &mut ack, joined).await;
                }

                if last_flush_at.elapsed() >= config.timer_processor_update_ack_interval {
                    flush_ack(
                        &engine,
                        &update_retry,
                        &mut ack,
                        &mut last_flushed_level,
                        &mut last_flush_at,
                    )
                    .await;
                }
                // More tasks may already be due.
                continue;
            }

            flush_ack(
                &engine,
                &update_retry,
                &mut ack,
                &mut last_flushed_level,
                &mut last_flush_at,
            )
            .await;

            let sleep_for = next_wake_delay(
                &engine,
                min_time,
                config.timer_processor_max_poll_interval,
            )
            .await;
            if sleep_for.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.shutdown_rx.changed() => {}
                _ = engine.timer_notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        flush_ack(
            &engine,
            &update_retry,
            &mut ack,
            &mut last_flushed_level,
            &mut last_flush_at,
        )
        .await;
        info!(shard_id, "timer queue processor stopped");
    }
}

async fn read_timer_tasks(
    engine: &Arc<HistoryEngine>,
    policy: &RetryPolicy,
    min_time: DateTime<Utc>,
    max_time: DateTime<Utc>,
    batch_size: usize,
) -> std::result::Result<Vec<TimerTask>, StoreError> {
    let store = engine.execution_store.clone();
    let shard_id = engine.shard.shard_id();
    retry(
        policy,
        move || {
            let store = store.clone();
            async move {
                store
                    .get_timer_tasks(shard_id, min_time, max_time, batch_size)
                    .await
            }
        },
        StoreError::is_transient,
    )
    .await
}

/// How long to sleep: until the earliest pending timer, bounded by the max
/// poll interval. Zero when a timer is already due.
async fn next_wake_delay(
    engine: &Arc<HistoryEngine>,
    min_time: DateTime<Utc>,
    max_poll_interval: Duration,
) -> Duration {
    let far_future = Utc::now() + TimeDelta::days(3650);
    let earliest = engine
        .execution_store
        .get_timer_tasks(engine.shard.shard_id(), min_time, far_future, 1)
        .await
        .ok()
        .and_then(|tasks| tasks.into_iter().next());

    match earliest {
        Some(task) => {
            let until_due = (task.visibility_time - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            until_due.min(max_poll_interval)
        }
        None => max_poll_interval,
    }
}

async fn handle_completion(
    engine: &Arc<HistoryEngine>,
    ack: &mut TimerAckManager,
    joined: std::result::Result<(DateTime<Utc>, i64, Result<()>), tokio::task::JoinError>,
) {
    let shard_id = engine.shard.shard_id();
    match joined {
        Ok((visibility_time, task_id, Ok(()))) => {
            incr(&engine.metrics.timer_tasks_fired);
            if let Err(err) = engine
                .execution_store
                .complete_timer_task(shard_id, visibility_time, task_id)
                .await
            {
                warn!(shard_id, task_id, error = %err, "timer task completion failed");
            }
            ack.complete(visibility_time, task_id);
        }
        Ok((_, task_id, Err(err))) => {
            incr(&engine.metrics.timer_task_failures);
            warn!(shard_id, task_id, error = %err, "timer task failed, will retry");
        }
        Err(join_err) => {
            incr(&engine.metrics.timer_task_failures);
            warn!(shard_id, error = %join_err, "timer worker panicked");
        }
    }
}

async fn flush_ack(
    engine: &Arc<HistoryEngine>,
    policy: &RetryPolicy,
    ack: &mut TimerAckManager,
    last_flushed_level: &mut DateTime<Utc>,
    last_flush_at: &mut Instant,
) {
    *last_flush_at = Instant::now();
    let level = ack.advance();
    if level <= *last_flushed_level {
        return;
    }
    let shard = engine.shard.clone();
    let result = retry(
        policy,
        move || {
            let shard = shard.clone();
            async move { shard.update_timer_ack_level(level).await }
        },
        EngineError::is_retryable,
    )
    .await;
    match result {
        Ok(()) => *last_flushed_level = level,
        Err(err) => {
            warn!(
                shard_id = engine.shard.shard_id(),
                ack_level = %level,
                error = %err,
                "timer ack level flush failed"
            );
        }
    }
}
