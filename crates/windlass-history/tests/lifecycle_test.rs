// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end lifecycle tests through the full service: queue processors
//! dispatch to recording clients, timers fire, and the controller unloads
//! shards on ownership loss.

mod common;

use std::time::Duration;

use windlass_api::events::EventAttributes;
use windlass_api::{
    CloseStatus, Decision, GetWorkflowExecutionNextEventIdRequest,
    RecordActivityTaskHeartbeatRequest, RecordActivityTaskStartedRequest,
    RecordDecisionTaskStartedRequest, RequestCancelWorkflowExecutionRequest,
    RespondActivityTaskCanceledRequest, RespondActivityTaskCompletedRequest,
    RespondActivityTaskFailedRequest, RespondDecisionTaskCompletedRequest,
    TerminateWorkflowExecutionRequest, WorkflowExecution,
};
use windlass_history::config::Config;
use windlass_history::error::EngineError;
use windlass_persistence::ShardStore;

use common::{TestService, history_events, start_request, start_service, wait_until};

fn fast_config() -> Config {
    Config {
        number_of_shards: 1,
        ..Config::fast_for_tests()
    }
}

async fn wait_for_decision_task(
    harness: &TestService,
    minimum_count: usize,
) -> windlass_history::client::DispatchedTask {
    wait_until(
        || harness.matching.decision_tasks().len() >= minimum_count,
        "decision task dispatched",
    )
    .await;
    harness.matching.decision_tasks()[minimum_count - 1].clone()
}

#[tokio::test]
async fn workflow_runs_activity_to_completion() {
    let harness = start_service(fast_config()).await;

    let run_id = harness
        .service
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap()
        .run_id;
    let execution = WorkflowExecution::new("w1", run_id);

    // The transfer queue hands the first decision to matching.
    let decision = wait_for_decision_task(&harness, 1).await;
    assert_eq!(decision.task_list, "default");

    let started = harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            request_id: "poll-1".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    assert_eq!(started.workflow_type, "order-fulfillment");
    assert_eq!(started.previous_started_event_id, 0);

    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            decisions: vec![Decision::ScheduleActivityTask {
                activity_id: "a1".into(),
                activity_type: "charge-card".into(),
                task_list: "activities".into(),
                input: Some(b"amount=5".to_vec()),
                schedule_to_close_timeout_seconds: 600,
                schedule_to_start_timeout_seconds: 0,
                start_to_close_timeout_seconds: 0,
                heartbeat_timeout_seconds: 30,
            }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    // The activity task reaches matching on its own task list.
    wait_until(
        || !harness.matching.activity_tasks().is_empty(),
        "activity task dispatched",
    )
    .await;
    let activity = harness.matching.activity_tasks()[0].clone();
    assert_eq!(activity.task_list, "activities");

    let activity_started = harness
        .service
        .record_activity_task_started(RecordActivityTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            request_id: "poll-2".into(),
            identity: "worker".into(),
        })
        .await
        .unwrap();
    assert_eq!(activity_started.activity_type, "charge-card");
    assert_eq!(activity_started.input.as_deref(), Some(b"amount=5".as_slice()));

    let heartbeat = harness
        .service
        .record_activity_task_heartbeat(RecordActivityTaskHeartbeatRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            details: Some(b"50%".to_vec()),
            identity: "worker".into(),
        })
        .await
        .unwrap();
    assert!(!heartbeat.cancel_requested);

    harness
        .service
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            result: Some(b"charged".to_vec()),
            identity: "worker".into(),
        })
        .await
        .unwrap();

    // Activity completion schedules the next decision.
    let next_decision = wait_for_decision_task(&harness, 2).await;
    harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: next_decision.schedule_id,
            request_id: "poll-3".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: next_decision.schedule_id,
            decisions: vec![Decision::CompleteWorkflowExecution {
                result: Some(b"done".to_vec()),
            }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    // The close task records the execution with visibility.
    wait_until(
        || !harness.visibility.closed_executions().is_empty(),
        "closed execution recorded",
    )
    .await;
    let (domain_id, closed, status) = harness.visibility.closed_executions()[0].clone();
    assert_eq!(domain_id, "d1");
    assert_eq!(closed, execution);
    assert_eq!(status, CloseStatus::Completed);

    // Further mutations are rejected.
    let err = harness
        .service
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            result: None,
            identity: "worker".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let events = history_events(&harness.store, "d1", &execution).await;
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "WorkflowExecutionStarted",
            "DecisionTaskCompleted",
            "ActivityTaskScheduled",
            "ActivityTaskStarted",
            "ActivityTaskCompleted",
            "DecisionTaskCompleted",
            "WorkflowExecutionCompleted",
        ]
    );

    harness.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_activity_leads_to_workflow_failure() {
    let harness = start_service(fast_config()).await;

    let run_id = harness
        .service
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap()
        .run_id;
    let execution = WorkflowExecution::new("w1", run_id);

    let decision = wait_for_decision_task(&harness, 1).await;
    harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            request_id: "poll-1".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            decisions: vec![Decision::ScheduleActivityTask {
                activity_id: "a1".into(),
                activity_type: "charge-card".into(),
                task_list: "activities".into(),
                input: None,
                schedule_to_close_timeout_seconds: 600,
                schedule_to_start_timeout_seconds: 0,
                start_to_close_timeout_seconds: 0,
                heartbeat_timeout_seconds: 0,
            }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    wait_until(
        || !harness.matching.activity_tasks().is_empty(),
        "activity task dispatched",
    )
    .await;
    let activity = harness.matching.activity_tasks()[0].clone();
    harness
        .service
        .record_activity_task_started(RecordActivityTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            request_id: "poll-2".into(),
            identity: "worker".into(),
        })
        .await
        .unwrap();

    harness
        .service
        .respond_activity_task_failed(RespondActivityTaskFailedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            reason: "card declined".into(),
            details: Some(b"code=51".to_vec()),
            identity: "worker".into(),
        })
        .await
        .unwrap();

    // The failure schedules the next decision; the decider gives up.
    let next_decision = wait_for_decision_task(&harness, 2).await;
    harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: next_decision.schedule_id,
            request_id: "poll-3".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: next_decision.schedule_id,
            decisions: vec![Decision::FailWorkflowExecution {
                reason: "payment failed".into(),
                details: None,
            }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    wait_until(
        || !harness.visibility.closed_executions().is_empty(),
        "failed execution recorded",
    )
    .await;
    let (_, closed, status) = harness.visibility.closed_executions()[0].clone();
    assert_eq!(closed, execution);
    assert_eq!(status, CloseStatus::Failed);

    let events = history_events(&harness.store, "d1", &execution).await;
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "WorkflowExecutionStarted",
            "DecisionTaskCompleted",
            "ActivityTaskScheduled",
            "ActivityTaskStarted",
            "ActivityTaskFailed",
            "DecisionTaskCompleted",
            "WorkflowExecutionFailed",
        ]
    );
    assert!(events.iter().any(|e| matches!(
        &e.attributes,
        EventAttributes::ActivityTaskFailed { reason, .. } if reason == "card declined"
    )));

    harness.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_request_propagates_to_activity_and_decider() {
    let harness = start_service(fast_config()).await;

    let run_id = harness
        .service
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap()
        .run_id;
    let execution = WorkflowExecution::new("w1", run_id);

    let decision = wait_for_decision_task(&harness, 1).await;
    harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            request_id: "poll-1".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            decisions: vec![Decision::ScheduleActivityTask {
                activity_id: "a1".into(),
                activity_type: "export-report".into(),
                task_list: "activities".into(),
                input: None,
                schedule_to_close_timeout_seconds: 600,
                schedule_to_start_timeout_seconds: 0,
                start_to_close_timeout_seconds: 0,
                heartbeat_timeout_seconds: 30,
            }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    wait_until(
        || !harness.matching.activity_tasks().is_empty(),
        "activity task dispatched",
    )
    .await;
    let activity = harness.matching.activity_tasks()[0].clone();
    harness
        .service
        .record_activity_task_started(RecordActivityTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            request_id: "poll-2".into(),
            identity: "worker".into(),
        })
        .await
        .unwrap();

    let cancel = RequestCancelWorkflowExecutionRequest {
        domain_id: "d1".into(),
        workflow_id: "w1".into(),
        run_id: None,
        identity: "ops".into(),
    };
    harness
        .service
        .request_cancel_workflow_execution(cancel.clone())
        .await
        .unwrap();
    // A repeated request is acknowledged without a second event.
    harness
        .service
        .request_cancel_workflow_execution(cancel)
        .await
        .unwrap();

    // The next heartbeat tells the worker to stop.
    let heartbeat = harness
        .service
        .record_activity_task_heartbeat(RecordActivityTaskHeartbeatRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            details: Some(b"30%".to_vec()),
            identity: "worker".into(),
        })
        .await
        .unwrap();
    assert!(heartbeat.cancel_requested);

    harness
        .service
        .respond_activity_task_canceled(RespondActivityTaskCanceledRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: activity.schedule_id,
            details: Some(b"stopped".to_vec()),
            identity: "worker".into(),
        })
        .await
        .unwrap();

    // The cancel request already scheduled the next decision; the decider
    // winds the workflow down.
    let next_decision = wait_for_decision_task(&harness, 2).await;
    harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: next_decision.schedule_id,
            request_id: "poll-3".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: next_decision.schedule_id,
            decisions: vec![Decision::CompleteWorkflowExecution { result: None }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    wait_until(
        || !harness.visibility.closed_executions().is_empty(),
        "canceled workflow closed",
    )
    .await;

    let events = history_events(&harness.store, "d1", &execution).await;
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "WorkflowExecutionStarted",
            "DecisionTaskCompleted",
            "ActivityTaskScheduled",
            "ActivityTaskStarted",
            "WorkflowExecutionCancelRequested",
            "ActivityTaskCanceled",
            "DecisionTaskCompleted",
            "WorkflowExecutionCompleted",
        ]
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(
                e.attributes,
                EventAttributes::WorkflowExecutionCancelRequested { .. }
            ))
            .count(),
        1
    );
    assert!(events.iter().any(|e| matches!(
        &e.attributes,
        EventAttributes::ActivityTaskCanceled { details: Some(details), .. }
            if details == b"stopped"
    )));

    harness.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn user_timer_fires_and_schedules_decision() {
    let harness = start_service(fast_config()).await;

    let run_id = harness
        .service
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap()
        .run_id;
    let execution = WorkflowExecution::new("w1", run_id);

    let decision = wait_for_decision_task(&harness, 1).await;
    harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            request_id: "poll-1".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: decision.schedule_id,
            decisions: vec![Decision::StartTimer {
                timer_id: "wake-up".into(),
                start_to_fire_timeout_seconds: 1,
            }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    // The timer fires and its decision task reaches matching.
    wait_until(
        || harness.matching.decision_tasks().len() >= 2,
        "post-timer decision task dispatched",
    )
    .await;

    let events = history_events(&harness.store, "d1", &execution).await;
    assert!(events.iter().any(|e| matches!(
        &e.attributes,
        EventAttributes::TimerFired { timer_id, .. } if timer_id == "wake-up"
    )));

    harness.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn terminate_closes_and_records_visibility() {
    let harness = start_service(fast_config()).await;

    let run_id = harness
        .service
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap()
        .run_id;
    let execution = WorkflowExecution::new("w1", run_id.clone());

    harness
        .service
        .terminate_workflow_execution(TerminateWorkflowExecutionRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            run_id: None,
            reason: "stuck".into(),
            details: None,
            identity: "ops".into(),
        })
        .await
        .unwrap();

    wait_until(
        || !harness.visibility.closed_executions().is_empty(),
        "terminated execution recorded",
    )
    .await;
    let (_, closed, status) = harness.visibility.closed_executions()[0].clone();
    assert_eq!(closed, execution);
    assert_eq!(status, CloseStatus::Terminated);

    harness.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn continue_as_new_closes_old_run_and_starts_fresh_one() {
    let harness = start_service(fast_config()).await;

    let old_run_id = harness
        .service
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap()
        .run_id;
    let old_execution = WorkflowExecution::new("w1", old_run_id.clone());

    let decision = wait_for_decision_task(&harness, 1).await;
    harness
        .service
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: old_execution.clone(),
            schedule_id: decision.schedule_id,
            request_id: "poll-1".into(),
            identity: "decider".into(),
        })
        .await
        .unwrap();
    harness
        .service
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "d1".into(),
            execution: old_execution.clone(),
            schedule_id: decision.schedule_id,
            decisions: vec![Decision::ContinueAsNewWorkflowExecution {
                workflow_type: "order-fulfillment".into(),
                task_list: "default".into(),
                input: Some(b"next-page".to_vec()),
                execution_start_to_close_timeout_seconds: 3600,
                task_start_to_close_timeout_seconds: 10,
            }],
            execution_context: None,
            identity: "decider".into(),
        })
        .await
        .unwrap();

    // The current pointer now names a fresh open run at its first decision.
    let current = harness
        .service
        .get_workflow_execution_next_event_id(GetWorkflowExecutionNextEventIdRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            run_id: None,
        })
        .await
        .unwrap();
    assert_ne!(current.run_id, old_run_id);
    assert_eq!(current.next_event_id, 2);

    // Old run's history closes with the continued-as-new event naming it.
    let old_events = history_events(&harness.store, "d1", &old_execution).await;
    match &old_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionContinuedAsNew { new_run_id, .. } => {
            assert_eq!(new_run_id, &current.run_id);
        }
        other => panic!("unexpected closing event: {other:?}"),
    }

    // The new run's first history batch is already durable.
    let new_execution = WorkflowExecution::new("w1", current.run_id.clone());
    let new_events = history_events(&harness.store, "d1", &new_execution).await;
    assert_eq!(new_events.len(), 1);
    assert!(matches!(
        &new_events[0].attributes,
        EventAttributes::WorkflowExecutionStarted { continued_from_run_id: Some(from), .. }
            if from == &old_run_id
    ));

    // And its first decision task gets dispatched.
    wait_until(
        || {
            harness
                .matching
                .decision_tasks()
                .iter()
                .any(|task| task.execution == new_execution)
        },
        "new run decision task dispatched",
    )
    .await;

    harness.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn ownership_loss_unloads_engine_from_controller() {
    // Long acquisition interval so the unloaded shard is not immediately
    // taken back while the test observes it.
    let config = Config {
        number_of_shards: 1,
        acquire_shard_interval: Duration::from_secs(3600),
        ..Config::fast_for_tests()
    };
    let harness = start_service(config).await;

    harness
        .service
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();

    // Another host steals the shard.
    let mut stolen = harness.store.get_shard(0).await.unwrap();
    stolen.owner = "host-b".into();
    let previous_range_id = stolen.range_id;
    stolen.range_id += 1;
    harness
        .store
        .update_shard(stolen, previous_range_id)
        .await
        .unwrap();

    let err = harness
        .service
        .terminate_workflow_execution(TerminateWorkflowExecutionRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            run_id: None,
            reason: "noop".into(),
            details: None,
            identity: "ops".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShardOwnershipLost { shard_id: 0 }));

    // The controller tears the engine down; routing now reports the loss.
    wait_until(
        || harness.service.controller().owned_shard_count() == 0,
        "engine unloaded",
    )
    .await;
    let err = harness
        .service
        .start_workflow_execution(start_request("w2", "start-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShardOwnershipLost { .. }));

    harness.service.shutdown().await.unwrap();
}
