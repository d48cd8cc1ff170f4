// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted record types and store request structs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use windlass_api::{CloseStatus, TimeoutType, WorkflowState};

/// Sentinel meaning "no event": event ids start at 1.
pub const EMPTY_EVENT_ID: i64 = 0;

/// One shard's lease row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard identifier, `0..number_of_shards`.
    pub shard_id: u32,
    /// Host currently holding the lease, opaque.
    pub owner: String,
    /// Lease fence; every conditional write on the shard compares it.
    pub range_id: i64,
    /// Steal count since the last ack-level flush.
    pub stolen_since_renew: i32,
    /// Highest transfer task id fully processed.
    pub transfer_ack_level: i64,
    /// Timestamp below which every timer task is fully processed.
    pub timer_ack_level: DateTime<Utc>,
}

impl ShardInfo {
    /// Fresh shard row as written at cluster provisioning.
    pub fn provisioned(shard_id: u32) -> Self {
        Self {
            shard_id,
            owner: String::new(),
            range_id: 0,
            stolen_since_renew: 0,
            transfer_ack_level: 0,
            timer_ack_level: DateTime::UNIX_EPOCH,
        }
    }
}

/// Authoritative per-run execution record.
///
/// Decision-task bookkeeping lives here: the pending decision is identified
/// by a synthetic `(decision_schedule_id, decision_started_id)` pair drawn
/// from the event-id counter, without materializing history events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionInfo {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Workflow identifier.
    pub workflow_id: String,
    /// Run identifier.
    pub run_id: String,
    /// Workflow implementation name.
    pub workflow_type: String,
    /// Task list decisions are dispatched to.
    pub task_list: String,
    /// Client-supplied input.
    pub input: Option<Vec<u8>>,
    /// Overall execution timeout.
    pub execution_start_to_close_timeout_seconds: i32,
    /// Per-decision timeout.
    pub task_start_to_close_timeout_seconds: i32,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// How the run closed, `None` while open.
    pub close_status: CloseStatus,
    /// Next history event id; doubles as the update condition.
    pub next_event_id: i64,
    /// Started id of the last completed decision, [`EMPTY_EVENT_ID`] when none.
    pub last_processed_event_id: i64,
    /// Idempotency token the run was started with.
    pub start_request_id: String,
    /// True once cancellation was requested.
    pub cancel_requested: bool,
    /// Opaque decider context from the last completed decision.
    pub execution_context: Option<Vec<u8>>,
    /// Schedule id of the pending decision, [`EMPTY_EVENT_ID`] when none.
    pub decision_schedule_id: i64,
    /// Started id of the pending decision, [`EMPTY_EVENT_ID`] when not started.
    pub decision_started_id: i64,
    /// Poller request id of the started decision, for start dedup.
    pub decision_request_id: String,
    /// Run this one continued from, when created by continue-as-new.
    pub continued_from_run_id: Option<String>,
    /// When the run was created.
    pub start_time: DateTime<Utc>,
    /// Last successful row update.
    pub last_updated: DateTime<Utc>,
}

/// One pending activity, keyed by its ActivityTaskScheduled event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Id of the ActivityTaskScheduled event; the pending-map key.
    pub schedule_id: i64,
    /// Id of the ActivityTaskStarted event, [`EMPTY_EVENT_ID`] until started.
    pub started_id: i64,
    /// Client-chosen activity identifier.
    pub activity_id: String,
    /// Activity implementation name.
    pub activity_type: String,
    /// Task list the activity is dispatched to.
    pub task_list: String,
    /// Activity input.
    pub input: Option<Vec<u8>>,
    /// Poller request id of the start, for dedup.
    pub request_id: String,
    /// Latest heartbeat details.
    pub details: Option<Vec<u8>>,
    /// Total allowed time from scheduling to close.
    pub schedule_to_close_timeout_seconds: i32,
    /// Allowed queue time before pickup.
    pub schedule_to_start_timeout_seconds: i32,
    /// Allowed execution time once started.
    pub start_to_close_timeout_seconds: i32,
    /// Max heartbeat gap, 0 to disable.
    pub heartbeat_timeout_seconds: i32,
    /// True once workflow cancellation was requested.
    pub cancel_requested: bool,
    /// When the activity was scheduled.
    pub scheduled_time: DateTime<Utc>,
    /// When the activity was started, if it was.
    pub started_time: Option<DateTime<Utc>>,
    /// Last heartbeat, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// One pending user timer, keyed by its client-chosen timer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// Client-chosen timer identifier; the pending-map key.
    pub timer_id: String,
    /// Id of the TimerStarted event.
    pub started_event_id: i64,
    /// When the timer fires.
    pub expiry: DateTime<Utc>,
}

/// One pending child execution, keyed by its initiating event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    /// Id of the initiating event; the pending-map key.
    pub initiated_id: i64,
    /// Id of the child-started event, [`EMPTY_EVENT_ID`] until started.
    pub started_id: i64,
    /// Child workflow identifier.
    pub workflow_id: String,
    /// Child run identifier.
    pub run_id: String,
    /// Child workflow implementation name.
    pub workflow_type: String,
}

/// Full mutable state of one run as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMutableState {
    /// Execution record.
    pub execution_info: WorkflowExecutionInfo,
    /// Pending activities keyed by scheduled event id.
    pub activity_infos: HashMap<i64, ActivityInfo>,
    /// Pending timers keyed by timer id.
    pub timer_infos: HashMap<String, TimerInfo>,
    /// Pending children keyed by initiated event id.
    pub child_execution_infos: HashMap<i64, ChildExecutionInfo>,
}

impl WorkflowMutableState {
    /// Fresh state around an execution record, with empty pending maps.
    pub fn new(execution_info: WorkflowExecutionInfo) -> Self {
        Self {
            execution_info,
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_execution_infos: HashMap::new(),
        }
    }
}

/// Durable record of a side effect to dispatch asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Shard-scoped monotonic id, assigned by the shard at write time.
    pub task_id: i64,
    /// Domain of the source workflow.
    pub domain_id: String,
    /// Workflow identifier of the source.
    pub workflow_id: String,
    /// Run identifier of the source.
    pub run_id: String,
    /// What to dispatch.
    pub kind: TransferTaskKind,
}

/// Transfer task payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferTaskKind {
    /// Offer the pending decision task to a matching poller.
    DecisionTask {
        /// Task list to dispatch on.
        task_list: String,
        /// Schedule id of the pending decision.
        schedule_id: i64,
    },
    /// Offer a scheduled activity task to a matching poller.
    ActivityTask {
        /// Task list to dispatch on.
        task_list: String,
        /// Id of the ActivityTaskScheduled event.
        schedule_id: i64,
    },
    /// Record the closed execution with visibility.
    CloseExecution,
}

/// Durable record of a future action keyed by visibility timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    /// Shard-scoped monotonic id, assigned by the shard at write time.
    pub task_id: i64,
    /// When the task becomes eligible to fire.
    pub visibility_time: DateTime<Utc>,
    /// Domain of the source workflow.
    pub domain_id: String,
    /// Workflow identifier of the source.
    pub workflow_id: String,
    /// Run identifier of the source.
    pub run_id: String,
    /// What fires.
    pub kind: TimerTaskKind,
}

/// Timer task payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerTaskKind {
    /// A user timer reached its expiry.
    UserTimer {
        /// Timer identifier.
        timer_id: String,
    },
    /// An activity deadline elapsed.
    ActivityTimeout {
        /// Which timeout fired.
        timeout_type: TimeoutType,
        /// Id of the ActivityTaskScheduled event.
        schedule_id: i64,
    },
    /// A started decision exceeded its start-to-close timeout.
    DecisionTimeout {
        /// Schedule id of the decision.
        schedule_id: i64,
    },
}

/// One stored history batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHistoryBatch {
    /// Event id of the first event in the batch.
    pub first_event_id: i64,
    /// Transaction id the batch was written under.
    pub transaction_id: i64,
    /// Serialized event batch.
    pub data: Vec<u8>,
}

/// Create a new execution row plus its initial tasks, atomically.
#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    /// Shard owning the workflow.
    pub shard_id: u32,
    /// Lease fence; stamped by the shard immediately before the call.
    pub range_id: i64,
    /// Initial execution record.
    pub execution_info: WorkflowExecutionInfo,
    /// Transfer tasks to enqueue, ids already assigned.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks to enqueue, ids already assigned.
    pub timer_tasks: Vec<TimerTask>,
}

/// Address one run.
#[derive(Debug, Clone)]
pub struct GetWorkflowExecutionRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Workflow identifier.
    pub workflow_id: String,
    /// Run identifier.
    pub run_id: String,
}

/// New run created atomically with the closing update of the old run.
#[derive(Debug, Clone)]
pub struct ContinueAsNewExecution {
    /// Execution record of the new run.
    pub execution_info: WorkflowExecutionInfo,
    /// Transfer tasks for the new run, ids already assigned.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks for the new run, ids already assigned.
    pub timer_tasks: Vec<TimerTask>,
}

/// Conditionally update an execution row plus enqueue its tasks, atomically.
#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    /// Shard owning the workflow.
    pub shard_id: u32,
    /// Lease fence; stamped by the shard immediately before the call.
    pub range_id: i64,
    /// Expected `next_event_id` of the stored row.
    pub condition: i64,
    /// Replacement execution record.
    pub execution_info: WorkflowExecutionInfo,
    /// Transfer tasks to enqueue, ids already assigned.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks to enqueue, ids already assigned.
    pub timer_tasks: Vec<TimerTask>,
    /// Pending activities to insert or replace.
    pub upsert_activity_infos: Vec<ActivityInfo>,
    /// Pending activity to remove.
    pub delete_activity_info: Option<i64>,
    /// Pending timers to insert or replace.
    pub upsert_timer_infos: Vec<TimerInfo>,
    /// Pending timers to remove.
    pub delete_timer_infos: Vec<String>,
    /// Pending children to insert or replace.
    pub upsert_child_execution_infos: Vec<ChildExecutionInfo>,
    /// Pending child to remove.
    pub delete_child_execution_info: Option<i64>,
    /// New run to create in the same transaction.
    pub continue_as_new: Option<ContinueAsNewExecution>,
    /// True when the run closed in this transaction.
    pub close_execution: bool,
}

impl UpdateWorkflowExecutionRequest {
    /// Minimal update for `execution_info` under `condition`, no tasks and
    /// no pending-map changes.
    pub fn row_only(
        shard_id: u32,
        execution_info: WorkflowExecutionInfo,
        condition: i64,
    ) -> Self {
        Self {
            shard_id,
            range_id: 0,
            condition,
            execution_info,
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            upsert_activity_infos: Vec::new(),
            delete_activity_info: None,
            upsert_timer_infos: Vec::new(),
            delete_timer_infos: Vec::new(),
            upsert_child_execution_infos: Vec::new(),
            delete_child_execution_info: None,
            continue_as_new: None,
            close_execution: false,
        }
    }
}

/// Append one serialized event batch to a run's history.
#[derive(Debug, Clone)]
pub struct AppendHistoryEventsRequest {
    /// Shard owning the workflow.
    pub shard_id: u32,
    /// Lease fence; stamped by the shard immediately before the call.
    pub range_id: i64,
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Workflow identifier.
    pub workflow_id: String,
    /// Run identifier.
    pub run_id: String,
    /// Event id of the first event in the batch; the append key.
    pub first_event_id: i64,
    /// Tie-breaker between two appends at the same key.
    pub transaction_id: i64,
    /// Serialized event batch.
    pub events: Vec<u8>,
    /// Replace an existing batch at the same key. Set only on the retry
    /// after a crash left an orphan batch from an uncommitted transaction.
    pub overwrite: bool,
}
