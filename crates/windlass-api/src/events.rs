// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History event types.
//!
//! Events are appended to a workflow's history in batches. Event ids are
//! assigned densely starting at 1; the first event of every run is
//! `WorkflowExecutionStarted`. Batches serialize to JSON for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Dense, monotonically increasing id within the run, starting at 1.
    pub event_id: i64,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Short name of the event type, for logging.
    pub fn event_type(&self) -> &'static str {
        self.attributes.event_type()
    }
}

/// Which timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// From task start to task close.
    StartToClose,
    /// From scheduling to task start.
    ScheduleToStart,
    /// From scheduling to task close.
    ScheduleToClose,
    /// Missed heartbeat.
    Heartbeat,
}

/// Typed event payloads.
///
/// Decision tasks are tracked in the execution row rather than as
/// scheduled/started events, so only their completion and timeout appear in
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventAttributes {
    /// First event of every run.
    WorkflowExecutionStarted {
        /// Workflow implementation name.
        workflow_type: String,
        /// Task list decisions are dispatched to.
        task_list: String,
        /// Client-supplied input.
        input: Option<Vec<u8>>,
        /// Overall execution timeout.
        execution_start_to_close_timeout_seconds: i32,
        /// Per-decision timeout.
        task_start_to_close_timeout_seconds: i32,
        /// Run this one continued from, when created by continue-as-new.
        continued_from_run_id: Option<String>,
    },
    /// A decision task finished and its decisions were applied.
    DecisionTaskCompleted {
        /// Synthetic schedule id from the execution row.
        scheduled_id: i64,
        /// Synthetic started id from the execution row.
        started_id: i64,
        /// Worker identity.
        identity: String,
        /// Opaque decider context carried across decisions.
        execution_context: Option<Vec<u8>>,
    },
    /// A started decision task exceeded its start-to-close timeout.
    DecisionTaskTimedOut {
        /// Synthetic schedule id from the execution row.
        scheduled_id: i64,
        /// Synthetic started id from the execution row.
        started_id: i64,
    },
    /// An activity was scheduled by a completed decision.
    ActivityTaskScheduled {
        /// Client-chosen activity identifier, unique among pending activities.
        activity_id: String,
        /// Activity implementation name.
        activity_type: String,
        /// Task list the activity is dispatched to.
        task_list: String,
        /// Activity input.
        input: Option<Vec<u8>>,
        /// Total allowed time from scheduling to close.
        schedule_to_close_timeout_seconds: i32,
        /// Allowed queue time before a worker picks the task up.
        schedule_to_start_timeout_seconds: i32,
        /// Allowed execution time once started.
        start_to_close_timeout_seconds: i32,
        /// Max heartbeat gap once started, 0 to disable.
        heartbeat_timeout_seconds: i32,
        /// The DecisionTaskCompleted event that produced this.
        decision_completed_event_id: i64,
    },
    /// A worker picked up the activity task.
    ActivityTaskStarted {
        /// Id of the ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// Worker identity.
        identity: String,
        /// Poller request id, used for at-most-once start dedup.
        request_id: String,
    },
    /// The activity completed successfully.
    ActivityTaskCompleted {
        /// Id of the ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// Id of the ActivityTaskStarted event.
        started_event_id: i64,
        /// Activity result.
        result: Option<Vec<u8>>,
        /// Worker identity.
        identity: String,
    },
    /// The activity failed.
    ActivityTaskFailed {
        /// Id of the ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// Id of the ActivityTaskStarted event.
        started_event_id: i64,
        /// Failure reason.
        reason: String,
        /// Failure details.
        details: Option<Vec<u8>>,
        /// Worker identity.
        identity: String,
    },
    /// The activity acknowledged cancellation.
    ActivityTaskCanceled {
        /// Id of the ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// Id of the ActivityTaskStarted event.
        started_event_id: i64,
        /// Cancellation details.
        details: Option<Vec<u8>>,
        /// Worker identity.
        identity: String,
    },
    /// The activity exceeded one of its timeouts.
    ActivityTaskTimedOut {
        /// Id of the ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// Id of the ActivityTaskStarted event, 0 when never started.
        started_event_id: i64,
        /// Which timeout fired.
        timeout_type: TimeoutType,
    },
    /// A user timer was started by a completed decision.
    TimerStarted {
        /// Client-chosen timer identifier, unique among pending timers.
        timer_id: String,
        /// Seconds until the timer fires.
        start_to_fire_timeout_seconds: i64,
        /// The DecisionTaskCompleted event that produced this.
        decision_completed_event_id: i64,
    },
    /// A user timer fired.
    TimerFired {
        /// Timer identifier.
        timer_id: String,
        /// Id of the TimerStarted event.
        started_event_id: i64,
    },
    /// A pending user timer was canceled by a completed decision.
    TimerCanceled {
        /// Timer identifier.
        timer_id: String,
        /// Id of the TimerStarted event.
        started_event_id: i64,
        /// The DecisionTaskCompleted event that produced this.
        decision_completed_event_id: i64,
    },
    /// The workflow received a signal.
    WorkflowExecutionSignaled {
        /// Signal name.
        signal_name: String,
        /// Signal payload.
        input: Option<Vec<u8>>,
        /// Sender identity.
        identity: String,
    },
    /// Cancellation of the workflow was requested.
    WorkflowExecutionCancelRequested {
        /// Requester identity.
        identity: String,
    },
    /// The workflow completed successfully.
    WorkflowExecutionCompleted {
        /// Workflow result.
        result: Option<Vec<u8>>,
        /// The DecisionTaskCompleted event that produced this.
        decision_completed_event_id: i64,
    },
    /// The workflow failed.
    WorkflowExecutionFailed {
        /// Failure reason.
        reason: String,
        /// Failure details.
        details: Option<Vec<u8>>,
        /// The DecisionTaskCompleted event that produced this.
        decision_completed_event_id: i64,
    },
    /// The workflow was terminated by an operator.
    WorkflowExecutionTerminated {
        /// Termination reason.
        reason: String,
        /// Termination details.
        details: Option<Vec<u8>>,
        /// Operator identity.
        identity: String,
    },
    /// The workflow closed in favor of a fresh run.
    WorkflowExecutionContinuedAsNew {
        /// Run id of the new execution.
        new_run_id: String,
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
        /// The DecisionTaskCompleted event that produced this.
        decision_completed_event_id: i64,
    },
}

impl EventAttributes {
    /// Short name of the event type, for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventAttributes::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            EventAttributes::DecisionTaskCompleted { .. } => "DecisionTaskCompleted",
            EventAttributes::DecisionTaskTimedOut { .. } => "DecisionTaskTimedOut",
            EventAttributes::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            EventAttributes::ActivityTaskStarted { .. } => "ActivityTaskStarted",
            EventAttributes::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            EventAttributes::ActivityTaskFailed { .. } => "ActivityTaskFailed",
            EventAttributes::ActivityTaskCanceled { .. } => "ActivityTaskCanceled",
            EventAttributes::ActivityTaskTimedOut { .. } => "ActivityTaskTimedOut",
            EventAttributes::TimerStarted { .. } => "TimerStarted",
            EventAttributes::TimerFired { .. } => "TimerFired",
            EventAttributes::TimerCanceled { .. } => "TimerCanceled",
            EventAttributes::WorkflowExecutionSignaled { .. } => "WorkflowExecutionSignaled",
            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                "WorkflowExecutionCancelRequested"
            }
            EventAttributes::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            EventAttributes::WorkflowExecutionFailed { .. } => "WorkflowExecutionFailed",
            EventAttributes::WorkflowExecutionTerminated { .. } => "WorkflowExecutionTerminated",
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                "WorkflowExecutionContinuedAsNew"
            }
        }
    }
}

/// Serialize an event batch for storage.
pub fn serialize_event_batch(events: &[HistoryEvent]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(events)
}

/// Deserialize a stored event batch.
pub fn deserialize_event_batch(data: &[u8]) -> Result<Vec<HistoryEvent>, serde_json::Error> {
    serde_json::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_batch_round_trip() {
        let events = vec![
            HistoryEvent {
                event_id: 1,
                timestamp: Utc::now(),
                attributes: EventAttributes::WorkflowExecutionStarted {
                    workflow_type: "order-fulfillment".to_string(),
                    task_list: "default".to_string(),
                    input: Some(b"{}".to_vec()),
                    execution_start_to_close_timeout_seconds: 3600,
                    task_start_to_close_timeout_seconds: 10,
                    continued_from_run_id: None,
                },
            },
            HistoryEvent {
                event_id: 2,
                timestamp: Utc::now(),
                attributes: EventAttributes::WorkflowExecutionSignaled {
                    signal_name: "payment-received".to_string(),
                    input: None,
                    identity: "test".to_string(),
                },
            },
        ];

        let data = serialize_event_batch(&events).unwrap();
        let decoded = deserialize_event_batch(&data).unwrap();
        assert_eq!(events, decoded);
    }

    #[test]
    fn event_type_names() {
        let attrs = EventAttributes::TimerFired {
            timer_id: "t1".to_string(),
            started_event_id: 5,
        };
        assert_eq!(attrs.event_type(), "TimerFired");
    }
}
