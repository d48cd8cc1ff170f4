// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-shard ownership and task-id sequencing.
//!
//! A [`ShardContext`] enforces single-writer semantics for everything under
//! one shard. One mutex serializes task-id assignment, range renewal, and
//! shard-row flushes; the current range id is additionally published through
//! an atomic so history appends can stamp it without taking the lock.
//!
//! Ownership is fenced by the shard row's `range_id`: every conditional
//! write carries it, and a mismatch comes back as ownership loss. Task ids
//! under range `r` are drawn from `[r << bits, (r + 1) << bits)`, so a range
//! renewal strictly raises the floor of the id space and ids never repeat.

pub mod controller;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use windlass_persistence::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, ExecutionStore, HistoryStore,
    ShardInfo, ShardStore, StoreError, TimerTask, UpdateWorkflowExecutionRequest,
};

use crate::config::Config;
use crate::error::{EngineError, Result};

/// Retry bound for detectable range races on conditional writes.
pub(crate) const CONDITIONAL_RETRY_COUNT: usize = 5;

/// Range id stamped on a closed shard so every later write is fenced out.
const CLOSED_RANGE_ID: i64 = -1;

struct ShardState {
    shard_info: ShardInfo,
    closed: bool,
    transfer_sequence_number: i64,
    max_transfer_sequence_number: i64,
    transfer_max_read_level: i64,
}

/// One owned shard.
pub struct ShardContext {
    shard_id: u32,
    config: Arc<Config>,
    shard_store: Arc<dyn ShardStore>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    close_tx: mpsc::UnboundedSender<u32>,
    // Mirror of the locked range id for the lock-free history-append path.
    range_id: AtomicI64,
    state: Mutex<ShardState>,
}

impl ShardContext {
    /// Acquire a shard: read its row, take over as `owner`, and renew the
    /// range with the steal counter bumped. Returns the live context.
    pub async fn acquire(
        shard_id: u32,
        owner: String,
        config: Arc<Config>,
        shard_store: Arc<dyn ShardStore>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        close_tx: mpsc::UnboundedSender<u32>,
    ) -> Result<Arc<ShardContext>> {
        let mut shard_info = shard_store.get_shard(shard_id).await?;
        shard_info.owner = owner;

        let context = Arc::new(ShardContext {
            shard_id,
            config,
            shard_store,
            execution_store,
            history_store,
            close_tx,
            range_id: AtomicI64::new(shard_info.range_id),
            state: Mutex::new(ShardState {
                shard_info,
                closed: false,
                transfer_sequence_number: 0,
                max_transfer_sequence_number: 0,
                transfer_max_read_level: 0,
            }),
        });

        {
            let mut state = context.state.lock().await;
            context.renew_range_locked(&mut state, true).await?;
        }

        Ok(context)
    }

    /// Shard identifier.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Current range id as published to the lock-free append path.
    pub fn current_range_id(&self) -> i64 {
        self.range_id.load(Ordering::Acquire)
    }

    /// True once the shard closed after ownership loss.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Next transfer task id, renewing the range at the window edge.
    pub async fn next_transfer_task_id(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        self.next_task_id_locked(&mut state).await
    }

    /// Highest task id safe for the transfer queue to read.
    pub async fn transfer_max_read_level(&self) -> i64 {
        self.state.lock().await.transfer_max_read_level
    }

    /// Highest transfer task id fully processed.
    pub async fn transfer_ack_level(&self) -> i64 {
        self.state.lock().await.shard_info.transfer_ack_level
    }

    /// Timestamp below which every timer task is fully processed.
    pub async fn timer_ack_level(&self) -> DateTime<Utc> {
        self.state.lock().await.shard_info.timer_ack_level
    }

    /// Advance the transfer ack level and flush the shard row.
    pub async fn update_transfer_ack_level(&self, ack_level: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.shard_info.transfer_ack_level = ack_level;
        state.shard_info.stolen_since_renew = 0;
        self.flush_shard_info_locked(&mut state).await
    }

    /// Advance the timer ack level and flush the shard row.
    pub async fn update_timer_ack_level(&self, ack_level: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.shard_info.timer_ack_level = ack_level;
        state.shard_info.stolen_since_renew = 0;
        self.flush_shard_info_locked(&mut state).await
    }

    /// Create an execution under this shard's lease.
    ///
    /// Assigns transfer and timer task ids in increasing order under the
    /// shard lock, stamps the current range id, and classifies the outcome.
    /// The lock is released across the row write so the sequencer stays
    /// available while the write is in flight; a renewal that lands in that
    /// window is a detectable range race, retried under the new range.
    pub async fn create_workflow_execution(
        &self,
        mut req: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut stamped_range_id = {
            let mut state = self.state.lock().await;

            // Ids are assigned under the lock, in increasing order.
            let mut max_read_level = state.transfer_max_read_level;
            for task in &mut req.transfer_tasks {
                let id = self.next_task_id_locked(&mut state).await?;
                debug!(shard_id = self.shard_id, task_id = id, "assigned transfer task id");
                task.task_id = id;
                max_read_level = id;
            }
            self.allocate_timer_ids_locked(&mut state, &mut req.timer_tasks)
                .await?;
            self.update_max_read_level_locked(&mut state, max_read_level);
            state.shard_info.range_id
        };

        for _attempt in 0..CONDITIONAL_RETRY_COUNT {
            req.range_id = stamped_range_id;
            let result = self.execution_store.create_workflow_execution(req.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(
                    err @ (StoreError::WorkflowExecutionAlreadyStarted { .. }
                    | StoreError::Busy(_)),
                ) => return Err(err.into()),
                Err(err @ StoreError::ShardOwnershipLost { .. }) => {
                    // The range may have been renewed by this host while the
                    // write was in flight; retry under the new range in that
                    // case, otherwise the shard is stolen.
                    let mut state = self.state.lock().await;
                    if stamped_range_id != state.shard_info.range_id {
                        stamped_range_id = state.shard_info.range_id;
                        continue;
                    }
                    self.close_shard_locked(&mut state);
                    return Err(err.into());
                }
                Err(err) => {
                    // Outcome unknown. Advance the range so a subsequent read
                    // either sees the write or proves it never landed.
                    let mut state = self.state.lock().await;
                    if self.renew_range_locked(&mut state, false).await.is_err() {
                        self.close_shard_locked(&mut state);
                    }
                    return Err(err.into());
                }
            }
        }

        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Update an execution under this shard's lease.
    ///
    /// Same structure as [`Self::create_workflow_execution`]; also assigns
    /// ids to tasks belonging to a continue-as-new extension.
    pub async fn update_workflow_execution(
        &self,
        mut req: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut stamped_range_id = {
            let mut state = self.state.lock().await;

            let mut max_read_level = state.transfer_max_read_level;
            for task in &mut req.transfer_tasks {
                let id = self.next_task_id_locked(&mut state).await?;
                debug!(shard_id = self.shard_id, task_id = id, "assigned transfer task id");
                task.task_id = id;
                max_read_level = id;
            }
            if let Some(new_run) = req.continue_as_new.as_mut() {
                for task in &mut new_run.transfer_tasks {
                    let id = self.next_task_id_locked(&mut state).await?;
                    debug!(shard_id = self.shard_id, task_id = id, "assigned transfer task id");
                    task.task_id = id;
                    max_read_level = id;
                }
            }
            self.allocate_timer_ids_locked(&mut state, &mut req.timer_tasks)
                .await?;
            if let Some(new_run) = req.continue_as_new.as_mut() {
                self.allocate_timer_ids_locked(&mut state, &mut new_run.timer_tasks)
                    .await?;
            }
            self.update_max_read_level_locked(&mut state, max_read_level);
            state.shard_info.range_id
        };

        for _attempt in 0..CONDITIONAL_RETRY_COUNT {
            req.range_id = stamped_range_id;
            let result = self.execution_store.update_workflow_execution(req.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(err @ (StoreError::ConditionFailed(_) | StoreError::Busy(_))) => {
                    return Err(err.into());
                }
                Err(err @ StoreError::ShardOwnershipLost { .. }) => {
                    let mut state = self.state.lock().await;
                    if stamped_range_id != state.shard_info.range_id {
                        stamped_range_id = state.shard_info.range_id;
                        continue;
                    }
                    self.close_shard_locked(&mut state);
                    return Err(err.into());
                }
                Err(err) => {
                    let mut state = self.state.lock().await;
                    if self.renew_range_locked(&mut state, false).await.is_err() {
                        self.close_shard_locked(&mut state);
                    }
                    return Err(err.into());
                }
            }
        }

        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Append a history batch.
    ///
    /// Deliberately lock-free: appends are keyed by `(run, first_event_id)`
    /// and safe to parallelize. On a key collision the append is retried
    /// once with `overwrite` set; that is the idempotency path for a crash
    /// between a history append and the execution-row update.
    pub async fn append_history_events(&self, mut req: AppendHistoryEventsRequest) -> Result<()> {
        req.range_id = self.range_id.load(Ordering::Acquire);
        let result = self.history_store.append_history_events(req.clone()).await;
        if let Err(StoreError::ConditionFailed(_)) = &result {
            debug!(
                shard_id = self.shard_id,
                first_event_id = req.first_event_id,
                transaction_id = req.transaction_id,
                "history batch exists, retrying with overwrite"
            );
            req.overwrite = true;
            return self
                .history_store
                .append_history_events(req)
                .await
                .map_err(Into::into);
        }
        result.map_err(Into::into)
    }

    async fn next_task_id_locked(&self, state: &mut ShardState) -> Result<i64> {
        if state.transfer_sequence_number >= state.max_transfer_sequence_number {
            self.renew_range_locked(state, false).await?;
        }
        let task_id = state.transfer_sequence_number;
        state.transfer_sequence_number += 1;
        Ok(task_id)
    }

    async fn allocate_timer_ids_locked(
        &self,
        state: &mut ShardState,
        timer_tasks: &mut [TimerTask],
    ) -> Result<()> {
        for task in timer_tasks {
            if task.visibility_time < state.shard_info.timer_ack_level {
                // The shard moved and this host's clock is behind the ack
                // level; a timer below it would never fire. Bump it just past
                // the ack level so it still gets delivered.
                warn!(
                    shard_id = self.shard_id,
                    visibility_time = %task.visibility_time,
                    timer_ack_level = %state.shard_info.timer_ack_level,
                    "timer visibility below ack level, bumping"
                );
                task.visibility_time = state.shard_info.timer_ack_level + TimeDelta::seconds(1);
            }
            task.task_id = self.next_task_id_locked(state).await?;
        }
        Ok(())
    }

    async fn renew_range_locked(&self, state: &mut ShardState, is_stealing: bool) -> Result<()> {
        let mut updated = state.shard_info.clone();
        updated.range_id += 1;
        if is_stealing {
            updated.stolen_since_renew += 1;
        }

        if let Err(err) = self
            .shard_store
            .update_shard(updated.clone(), state.shard_info.range_id)
            .await
        {
            warn!(
                shard_id = self.shard_id,
                range_id = state.shard_info.range_id,
                error = %err,
                "shard range renewal failed"
            );
            if matches!(
                err,
                StoreError::ShardOwnershipLost { .. } | StoreError::ConditionFailed(_)
            ) {
                self.close_shard_locked(state);
            }
            return Err(err.into());
        }

        let bits = u32::from(self.config.range_size_bits);
        state.transfer_sequence_number = updated.range_id << bits;
        state.max_transfer_sequence_number = (updated.range_id + 1) << bits;
        state.transfer_max_read_level = state.transfer_sequence_number - 1;
        self.range_id.store(updated.range_id, Ordering::Release);
        state.shard_info = updated;

        info!(
            shard_id = self.shard_id,
            range_id = state.shard_info.range_id,
            sequence_number = state.transfer_sequence_number,
            max_sequence_number = state.max_transfer_sequence_number,
            "shard range renewed"
        );
        Ok(())
    }

    fn update_max_read_level_locked(&self, state: &mut ShardState, read_level: i64) {
        if read_level > state.transfer_max_read_level {
            debug!(
                shard_id = self.shard_id,
                read_level, "advancing transfer max read level"
            );
            state.transfer_max_read_level = read_level;
        }
    }

    async fn flush_shard_info_locked(&self, state: &mut ShardState) -> Result<()> {
        let updated = state.shard_info.clone();
        if let Err(err) = self
            .shard_store
            .update_shard(updated, state.shard_info.range_id)
            .await
        {
            if matches!(err, StoreError::ShardOwnershipLost { .. }) {
                self.close_shard_locked(state);
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn close_shard_locked(&self, state: &mut ShardState) {
        if state.closed {
            return;
        }
        state.closed = true;

        // Fences out any write that starts after this point.
        state.shard_info.range_id = CLOSED_RANGE_ID;
        self.range_id.store(CLOSED_RANGE_ID, Ordering::Release);

        warn!(shard_id = self.shard_id, "shard closed, requesting unload");
        let _ = self.close_tx.send(self.shard_id);
    }
}
