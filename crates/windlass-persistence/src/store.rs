// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store traits implemented by every persistence backend.
//!
//! The contract is split along the three record families a shard touches:
//! the shard lease row, execution rows plus their task queues, and
//! append-only history. A backend normally implements all three.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, GetWorkflowExecutionRequest,
    ShardInfo, StoredHistoryBatch, TimerTask, TransferTask, UpdateWorkflowExecutionRequest,
    WorkflowMutableState,
};

/// Shard lease rows.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Create a shard row if it does not exist yet. Idempotent.
    async fn create_shard(&self, shard: ShardInfo) -> Result<()>;

    /// Read a shard row.
    async fn get_shard(&self, shard_id: u32) -> Result<ShardInfo>;

    /// Replace a shard row, conditioned on the stored `range_id` matching
    /// `previous_range_id`. A mismatch fails with
    /// [`StoreError::ShardOwnershipLost`](crate::StoreError::ShardOwnershipLost).
    async fn update_shard(&self, shard: ShardInfo, previous_range_id: i64) -> Result<()>;
}

/// Execution rows and the per-shard transfer/timer task queues.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create an execution row plus its initial tasks, atomically. Fails with
    /// `WorkflowExecutionAlreadyStarted` when an open run exists for the
    /// workflow id, and with `ShardOwnershipLost` on a stale `range_id`.
    async fn create_workflow_execution(&self, req: CreateWorkflowExecutionRequest) -> Result<()>;

    /// Read one run's full mutable state.
    async fn get_workflow_execution(
        &self,
        req: GetWorkflowExecutionRequest,
    ) -> Result<WorkflowMutableState>;

    /// Conditionally update an execution row, apply pending-map diffs,
    /// enqueue tasks, and optionally create a continued-as-new run, all
    /// atomically. Fails with `ConditionFailed` when the stored
    /// `next_event_id` differs from `condition`, and with
    /// `ShardOwnershipLost` on a stale `range_id`.
    async fn update_workflow_execution(&self, req: UpdateWorkflowExecutionRequest) -> Result<()>;

    /// Remove an execution row.
    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()>;

    /// Run id currently registered for a workflow id.
    async fn get_current_run_id(&self, domain_id: &str, workflow_id: &str) -> Result<String>;

    /// Read transfer tasks with `read_level < task_id <= max_read_level`,
    /// ordered by task id.
    async fn get_transfer_tasks(
        &self,
        shard_id: u32,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTask>>;

    /// Remove a processed transfer task.
    async fn complete_transfer_task(&self, shard_id: u32, task_id: i64) -> Result<()>;

    /// Read timer tasks with `min_time <= visibility_time <= max_time`,
    /// ordered by `(visibility_time, task_id)`.
    async fn get_timer_tasks(
        &self,
        shard_id: u32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTask>>;

    /// Remove a processed timer task.
    async fn complete_timer_task(
        &self,
        shard_id: u32,
        visibility_time: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()>;
}

/// Append-only history blobs keyed by `(domain, workflow, run, first_event_id)`.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one serialized batch. A batch already stored at the same key
    /// fails with `ConditionFailed` unless `overwrite` is set, in which case
    /// the incoming batch deterministically replaces it.
    async fn append_history_events(&self, req: AppendHistoryEventsRequest) -> Result<()>;

    /// Read all batches of a run, ordered by first event id.
    async fn get_workflow_execution_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Vec<StoredHistoryBatch>>;

    /// Remove all history of a run.
    async fn delete_workflow_execution_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()>;
}

/// Create any missing shard rows for `0..number_of_shards`.
///
/// Called once at cluster provisioning; safe to call again on every start.
pub async fn provision_shards(store: &dyn ShardStore, number_of_shards: u32) -> Result<()> {
    for shard_id in 0..number_of_shards {
        store.create_shard(ShardInfo::provisioned(shard_id)).await?;
    }
    Ok(())
}
