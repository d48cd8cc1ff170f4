// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response types for the history RPC surface.
//!
//! Every request carries a `domain_id`. Requests addressing a specific run
//! carry a [`WorkflowExecution`](crate::WorkflowExecution); operations that
//! may target "the current run" take an optional run id instead.

use serde::{Deserialize, Serialize};

use crate::WorkflowExecution;

/// Start a new workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowExecutionRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Client-chosen workflow identifier.
    pub workflow_id: String,
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
    /// Idempotency token; a retried start with the same id returns the
    /// existing run instead of failing.
    pub request_id: String,
}

/// Response to [`StartWorkflowExecutionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowExecutionResponse {
    /// Run id of the (possibly pre-existing) execution.
    pub run_id: String,
}

/// Look up the next event id of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetWorkflowExecutionNextEventIdRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Workflow identifier.
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
}

/// Response to [`GetWorkflowExecutionNextEventIdRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetWorkflowExecutionNextEventIdResponse {
    /// Run the answer refers to.
    pub run_id: String,
    /// Next event id of that run.
    pub next_event_id: i64,
    /// Task list decisions are dispatched to.
    pub task_list: String,
}

/// Record that a poller started the pending decision task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDecisionTaskStartedRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Schedule id from the transfer task.
    pub schedule_id: i64,
    /// Poller request id, used for at-most-once start dedup.
    pub request_id: String,
    /// Poller identity.
    pub identity: String,
}

/// Response to [`RecordDecisionTaskStartedRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDecisionTaskStartedResponse {
    /// Workflow implementation name.
    pub workflow_type: String,
    /// Started id of the last completed decision, 0 when none.
    pub previous_started_event_id: i64,
    /// Started id assigned to this decision.
    pub started_event_id: i64,
    /// Next event id at the time the decision started.
    pub next_event_id: i64,
}

/// One command produced by a decider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision_type", rename_all = "snake_case")]
pub enum Decision {
    /// Schedule an activity.
    ScheduleActivityTask {
        /// Client-chosen activity identifier.
        activity_id: String,
        /// Activity implementation name.
        activity_type: String,
        /// Task list the activity is dispatched to.
        task_list: String,
        /// Activity input.
        input: Option<Vec<u8>>,
        /// Total allowed time from scheduling to close; 0 for the domain default.
        schedule_to_close_timeout_seconds: i32,
        /// Allowed queue time before pickup; 0 for the domain default.
        schedule_to_start_timeout_seconds: i32,
        /// Allowed execution time once started; 0 for the domain default.
        start_to_close_timeout_seconds: i32,
        /// Max heartbeat gap, 0 to disable.
        heartbeat_timeout_seconds: i32,
    },
    /// Start a user timer.
    StartTimer {
        /// Client-chosen timer identifier.
        timer_id: String,
        /// Seconds until the timer fires.
        start_to_fire_timeout_seconds: i64,
    },
    /// Cancel a pending user timer.
    CancelTimer {
        /// Timer identifier.
        timer_id: String,
    },
    /// Close the workflow successfully.
    CompleteWorkflowExecution {
        /// Workflow result.
        result: Option<Vec<u8>>,
    },
    /// Close the workflow as failed.
    FailWorkflowExecution {
        /// Failure reason.
        reason: String,
        /// Failure details.
        details: Option<Vec<u8>>,
    },
    /// Close this run and start a fresh one in the same transaction.
    ContinueAsNewWorkflowExecution {
        /// Workflow implementation name for the new run.
        workflow_type: String,
        /// Task list for the new run.
        task_list: String,
        /// Input for the new run.
        input: Option<Vec<u8>>,
        /// Overall execution timeout for the new run.
        execution_start_to_close_timeout_seconds: i32,
        /// Per-decision timeout for the new run.
        task_start_to_close_timeout_seconds: i32,
    },
}

/// Complete the started decision task and apply its decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondDecisionTaskCompletedRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Schedule id of the decision being completed.
    pub schedule_id: i64,
    /// Decisions to apply, in order.
    pub decisions: Vec<Decision>,
    /// Opaque decider context carried to the next decision.
    pub execution_context: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// Record that a poller started a scheduled activity task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordActivityTaskStartedRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Id of the ActivityTaskScheduled event.
    pub schedule_id: i64,
    /// Poller request id, used for at-most-once start dedup.
    pub request_id: String,
    /// Poller identity.
    pub identity: String,
}

/// Response to [`RecordActivityTaskStartedRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordActivityTaskStartedResponse {
    /// Activity implementation name.
    pub activity_type: String,
    /// Activity input.
    pub input: Option<Vec<u8>>,
    /// Id of the ActivityTaskStarted event.
    pub started_event_id: i64,
    /// Allowed execution time once started.
    pub start_to_close_timeout_seconds: i32,
    /// Max heartbeat gap, 0 to disable.
    pub heartbeat_timeout_seconds: i32,
}

/// Record activity liveness and progress details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Id of the ActivityTaskScheduled event.
    pub schedule_id: i64,
    /// Progress details, persisted for resume-after-failure.
    pub details: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// Response to [`RecordActivityTaskHeartbeatRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatResponse {
    /// True when cancellation of the workflow was requested; the worker
    /// should stop the activity and respond canceled.
    pub cancel_requested: bool,
}

/// Report successful completion of a started activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondActivityTaskCompletedRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Id of the ActivityTaskScheduled event.
    pub schedule_id: i64,
    /// Activity result.
    pub result: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// Report failure of a started activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondActivityTaskFailedRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Id of the ActivityTaskScheduled event.
    pub schedule_id: i64,
    /// Failure reason.
    pub reason: String,
    /// Failure details.
    pub details: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// Report cancellation of a started activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondActivityTaskCanceledRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Id of the ActivityTaskScheduled event.
    pub schedule_id: i64,
    /// Cancellation details.
    pub details: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// Deliver a signal to a running workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalWorkflowExecutionRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Workflow identifier.
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
    /// Signal name.
    pub signal_name: String,
    /// Signal payload.
    pub input: Option<Vec<u8>>,
    /// Sender identity.
    pub identity: String,
}

/// Request cooperative cancellation of a running workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCancelWorkflowExecutionRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Workflow identifier.
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
    /// Requester identity.
    pub identity: String,
}

/// Forcibly close a running workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateWorkflowExecutionRequest {
    /// Domain the workflow belongs to.
    pub domain_id: String,
    /// Workflow identifier.
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
    /// Termination reason.
    pub reason: String,
    /// Termination details.
    pub details: Option<Vec<u8>>,
    /// Operator identity.
    pub identity: String,
}
