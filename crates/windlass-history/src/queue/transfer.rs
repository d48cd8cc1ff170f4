// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer queue processor.
//!
//! One long-running loop per shard: read a batch of transfer tasks above the
//! ack level, fan out to a bounded worker pool, delete each task on success,
//! and periodically flush the contiguous-prefix ack level to the shard row.
//! A failed task stays in the queue and is re-read on a later poll; dispatch
//! is at-least-once and the downstream clients tolerate duplicates.

use std::time::Instant;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use windlass_api::WorkflowExecution;
use windlass_persistence::{GetWorkflowExecutionRequest, StoreError, TransferTask, TransferTaskKind};

use crate::engine::HistoryEngine;
use crate::error::Result;
use crate::metrics::incr;
use crate::queue::{TaskAckManager, TokenBucket};

pub(crate) struct TransferQueueProcessor {
    engine: Arc<HistoryEngine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TransferQueueProcessor {
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

        let mut ack = TaskAckManager::new(shard.transfer_ack_level().await);
        let mut bucket = TokenBucket::new(config.transfer_processor_max_poll_rps);
        let mut last_flushed_level = ack.level();
        let mut last_flush_at = Instant::now();

        info!(shard_id, "transfer queue processor started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            if shard.is_closed().await {
                break;
            }

            let wait = bucket.acquire();
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let read_level = ack.advance();
            let max_read_level = shard.transfer_max_read_level().await;
            let tasks = match engine
                .execution_store
                .get_transfer_tasks(
                    shard_id,
                    read_level,
                    max_read_level,
                    config.transfer_task_batch_size,
                )
                .await
            {
                Ok(tasks) => tasks,
                Err(err) => {
                    warn!(shard_id, error = %err, "transfer task read failed");
                    Vec::new()
                }
            };

            if tasks.is_empty() {
                flush_ack(&engine, &mut ack, &mut last_flushed_level, &mut last_flush_at).await;
                tokio::select! {
                    _ = self.shutdown_rx.changed() => {}
                    _ = engine.transfer_notify.notified() => {}
                    _ = tokio::time::sleep(config.transfer_processor_max_poll_interval) => {}
                }
                continue;
            }

            debug!(shard_id, count = tasks.len(), "dispatching transfer tasks");
            let mut workers: JoinSet<(i64, Result<()>)> = JoinSet::new();
            for task in tasks {
                ack.begin(task.task_id);
                while workers.len() >= config.transfer_task_worker_count {
                    if let Some(joined) = workers.join_next().await {
                        handle_completion(&engine, &mut ack, joined).await;
                    }
                }
                let engine = engine.clone();
                workers.spawn(async move {
                    let task_id = task.task_id;
                    let result = process_transfer_task(&engine, &task).await;
                    (task_id, result)
                });
            }
            while let Some(joined) = workers.join_next().await {
                handle_completion(&engine, &mut ack, joined).await;
            }

            if last_flush_at.elapsed() >= config.transfer_processor_update_ack_interval {
                flush_ack(&engine, &mut ack, &mut last_flushed_level, &mut last_flush_at).await;
            }
        }

        flush_ack(&engine, &mut ack, &mut last_flushed_level, &mut last_flush_at).await;
        info!(shard_id, "transfer queue processor stopped");
    }
}

async fn handle_completion(
    engine: &Arc<HistoryEngine>,
    ack: &mut TaskAckManager,
    joined: std::result::Result<(i64, Result<()>), tokio::task::JoinError>,
) {
    let shard_id = engine.shard.shard_id();
    match joined {
        Ok((task_id, Ok(()))) => {
            incr(&engine.metrics.transfer_tasks_dispatched);
            if let Err(err) = engine
                .execution_store
                .complete_transfer_task(shard_id, task_id)
                .await
            {
                // The task will be re-read and re-dispatched; downstream
                // dispatch tolerates duplicates.
                warn!(shard_id, task_id, error = %err, "transfer task completion failed");
            }
            ack.complete(task_id);
        }
        Ok((task_id, Err(err))) => {
            incr(&engine.metrics.transfer_task_failures);
            warn!(shard_id, task_id, error = %err, "transfer task dispatch failed, will retry");
        }
        Err(join_err) => {
            incr(&engine.metrics.transfer_task_failures);
            warn!(shard_id, error = %join_err, "transfer worker panicked");
        }
    }
}

async fn flush_ack(
    engine: &Arc<HistoryEngine>,
    ack: &mut TaskAckManager,
    last_flushed_level: &mut i64,
    last_flush_at: &mut Instant,
) {
    *last_flush_at = Instant::now();
    let level = ack.advance();
    if level <= *last_flushed_level {
        return;
    }
    match engine.shard.update_transfer_ack_level(level).await {
        Ok(()) => *last_flushed_level = level,
        Err(err) => {
            warn!(
                shard_id = engine.shard.shard_id(),
                ack_level = level,
                error = %err,
                "transfer ack level flush failed"
            );
        }
    }
}

async fn process_transfer_task(engine: &Arc<HistoryEngine>, task: &TransferTask) -> Result<()> {
    let execution = WorkflowExecution::new(task.workflow_id.clone(), task.run_id.clone());
    match &task.kind {
        TransferTaskKind::DecisionTask {
            task_list,
            schedule_id,
        } => {
            engine
                .matching
                .add_decision_task(&task.domain_id, &execution, task_list, *schedule_id)
                .await
        }
        TransferTaskKind::ActivityTask {
            task_list,
            schedule_id,
        } => {
            engine
                .matching
                .add_activity_task(&task.domain_id, &execution, task_list, *schedule_id)
                .await
        }
        TransferTaskKind::CloseExecution => {
            let state = engine
                .execution_store
                .get_workflow_execution(GetWorkflowExecutionRequest {
                    domain_id: task.domain_id.clone(),
                    workflow_id: task.workflow_id.clone(),
                    run_id: task.run_id.clone(),
                })
                .await;
            let close_status = match state {
                Ok(state) => state.execution_info.close_status,
                // Already removed; nothing left to record.
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            engine
                .visibility
                .record_closed_execution(&task.domain_id, &execution, close_status)
                .await
        }
    }
}
