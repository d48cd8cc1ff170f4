// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine-level scenarios against the memory store, without the queue
//! processors: start semantics, range rollover, ownership loss, the
//! crash-between-append-and-update recovery path, and concurrent update
//! conflicts.

mod common;

use std::sync::Arc;

use windlass_api::events::EventAttributes;
use windlass_api::{
    Decision, GetWorkflowExecutionNextEventIdRequest, RecordDecisionTaskStartedRequest,
    RespondDecisionTaskCompletedRequest, SignalWorkflowExecutionRequest, WorkflowExecution,
};
use windlass_history::config::Config;
use windlass_history::error::EngineError;
use windlass_history::execution::WorkflowExecutionContext;
use windlass_persistence::{
    ExecutionStore, GetWorkflowExecutionRequest, HistoryStore, ShardStore, StoreError, StoreOp,
    TransferTaskKind,
};

use common::{history_events, start_engine, start_request};

fn single_shard_config() -> Config {
    Config {
        number_of_shards: 1,
        ..Config::default()
    }
}

#[tokio::test]
async fn happy_start_creates_run_row_and_decision_task() {
    let harness = start_engine(single_shard_config()).await;

    let response = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();
    assert!(!response.run_id.is_empty());

    let state = harness
        .store
        .get_workflow_execution(GetWorkflowExecutionRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            run_id: response.run_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(state.execution_info.next_event_id, 2);
    assert_eq!(state.execution_info.decision_schedule_id, 2);

    // Exactly one decision transfer task, first id of range 1.
    let tasks = harness
        .store
        .get_transfer_tasks(0, 0, i64::MAX, 10)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, 1 << 20);
    assert!(matches!(
        tasks[0].kind,
        TransferTaskKind::DecisionTask { schedule_id: 2, .. }
    ));

    // History holds the single started event.
    let execution = WorkflowExecution::new("w1", response.run_id);
    let events = history_events(&harness.store, "d1", &execution).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, 1);
    assert!(matches!(
        events[0].attributes,
        EventAttributes::WorkflowExecutionStarted { .. }
    ));
}

#[tokio::test]
async fn retried_start_with_same_request_id_returns_existing_run() {
    let harness = start_engine(single_shard_config()).await;

    let first = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();
    let second = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();
    assert_eq!(first.run_id, second.run_id);

    let err = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-2"))
        .await
        .unwrap_err();
    match err {
        EngineError::WorkflowExecutionAlreadyStarted { run_id, .. } => {
            assert_eq!(run_id, first.run_id);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn range_rollover_during_successive_starts() {
    // 16 task ids per range.
    let config = Config {
        number_of_shards: 1,
        range_size_bits: 4,
        ..Config::default()
    };
    let harness = start_engine(config).await;

    for index in 0..20 {
        harness
            .engine
            .start_workflow_execution(start_request(&format!("w{index}"), &format!("req-{index}")))
            .await
            .unwrap();
    }

    let tasks = harness
        .store
        .get_transfer_tasks(0, 0, i64::MAX, 100)
        .await
        .unwrap();
    let ids: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();
    let expected: Vec<i64> = (16..36).collect();
    assert_eq!(ids, expected);

    // One rollover: range 1 covered ids 16..31, range 2 the rest.
    assert_eq!(harness.store.get_shard(0).await.unwrap().range_id, 2);
}

#[tokio::test]
async fn lost_ownership_on_update_closes_shard() {
    let mut harness = start_engine(single_shard_config()).await;

    let response = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();

    // Another host steals the shard.
    let mut stolen = harness.store.get_shard(0).await.unwrap();
    stolen.owner = "host-b".into();
    stolen.range_id += 1;
    harness.store.update_shard(stolen, 1).await.unwrap();

    let signal = SignalWorkflowExecutionRequest {
        domain_id: "d1".into(),
        workflow_id: "w1".into(),
        run_id: Some(response.run_id.clone()),
        signal_name: "payment-received".into(),
        input: None,
        identity: "test".into(),
    };
    let err = harness
        .engine
        .signal_workflow_execution(signal.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShardOwnershipLost { shard_id: 0 }));

    // The shard reported itself for unload and fences later writes.
    assert_eq!(harness.close_rx.recv().await, Some(0));
    assert!(harness.engine.shard().is_closed().await);
    let err = harness.engine.signal_workflow_execution(signal).await.unwrap_err();
    assert!(matches!(err, EngineError::ShardOwnershipLost { .. }));
}

#[tokio::test]
async fn crash_between_append_and_row_update_recovers_by_overwrite() {
    let harness = start_engine(single_shard_config()).await;

    let response = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();
    let execution = WorkflowExecution::new("w1", response.run_id.clone());

    harness
        .engine
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: "d1".into(),
            execution: execution.clone(),
            schedule_id: 2,
            request_id: "poll-1".into(),
            identity: "worker".into(),
        })
        .await
        .unwrap();

    let respond = RespondDecisionTaskCompletedRequest {
        domain_id: "d1".into(),
        execution: execution.clone(),
        schedule_id: 2,
        decisions: vec![
            Decision::ScheduleActivityTask {
                activity_id: "a1".into(),
                activity_type: "charge-card".into(),
                task_list: "default".into(),
                input: None,
                schedule_to_close_timeout_seconds: 0,
                schedule_to_start_timeout_seconds: 0,
                start_to_close_timeout_seconds: 0,
                heartbeat_timeout_seconds: 0,
            },
            Decision::StartTimer {
                timer_id: "t1".into(),
                start_to_fire_timeout_seconds: 300,
            },
        ],
        execution_context: None,
        identity: "worker".into(),
    };

    // The history append lands, then the row update dies: the classic
    // crash window between the two phases.
    harness.store.inject_failure(
        StoreOp::UpdateWorkflowExecution,
        StoreError::Internal("connection reset mid-write".into()),
    );
    let err = harness
        .engine
        .respond_decision_task_completed(respond.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Fatal(_)));

    // Orphan batch exists; the row never moved.
    let batches = harness
        .store
        .get_workflow_execution_history("d1", "w1", &execution.run_id)
        .await
        .unwrap();
    assert_eq!(batches.len(), 2);
    let state = harness
        .store
        .get_workflow_execution(GetWorkflowExecutionRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            run_id: execution.run_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(state.execution_info.next_event_id, 2);

    // The replay collides on (run, first_event_id) and wins by overwrite;
    // the row update then applies under the original condition.
    harness
        .engine
        .respond_decision_task_completed(respond)
        .await
        .unwrap();

    let state = harness
        .store
        .get_workflow_execution(GetWorkflowExecutionRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            run_id: execution.run_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(state.execution_info.next_event_id, 5);
    assert_eq!(state.activity_infos.len(), 1);
    assert_eq!(state.timer_infos.len(), 1);

    // Exactly one batch at first event 2, and the event trail is dense.
    let events = history_events(&harness.store, "d1", &execution).await;
    assert_eq!(
        events.iter().map(|e| e.event_id).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}

#[tokio::test]
async fn concurrent_update_conflict_invalidates_loser() {
    let harness = start_engine(single_shard_config()).await;

    let response = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();
    let execution = WorkflowExecution::new("w1", response.run_id.clone());
    let shard = harness.engine.shard().clone();
    let execution_store = harness.store.clone() as Arc<dyn ExecutionStore>;
    let config = Arc::new(single_shard_config());

    // Two contexts load the same execution at next_event_id 2.
    let mut first = WorkflowExecutionContext::new(
        "d1".into(),
        execution.clone(),
        shard.clone(),
        execution_store.clone(),
        config.clone(),
    );
    let mut second = WorkflowExecutionContext::new(
        "d1".into(),
        execution.clone(),
        shard.clone(),
        execution_store,
        config,
    );
    first.load().await.unwrap();
    second.load().await.unwrap();

    first
        .mutable_state()
        .unwrap()
        .add_workflow_execution_signaled_event("s1", None, "a");
    second
        .mutable_state()
        .unwrap()
        .add_workflow_execution_signaled_event("s2", None, "b");

    let txn = shard.next_transfer_task_id().await.unwrap();
    first
        .update_workflow_execution(Vec::new(), Vec::new(), txn)
        .await
        .unwrap();

    // The loser sees a conflict and its cached builder is discarded.
    let txn = shard.next_transfer_task_id().await.unwrap();
    let err = second
        .update_workflow_execution(Vec::new(), Vec::new(), txn)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict));
    assert!(second.mutable_state().is_err());

    // Reload and retry from the winner's state.
    second.load().await.unwrap();
    assert_eq!(second.mutable_state().unwrap().next_event_id(), 3);
    second
        .mutable_state()
        .unwrap()
        .add_workflow_execution_signaled_event("s2", None, "b");
    let txn = shard.next_transfer_task_id().await.unwrap();
    second
        .update_workflow_execution(Vec::new(), Vec::new(), txn)
        .await
        .unwrap();

    let events = history_events(&harness.store, "d1", &execution).await;
    assert_eq!(events.len(), 3);
    assert_eq!(events.last().unwrap().event_id, 3);
}

#[tokio::test]
async fn next_event_id_lookup_resolves_current_run() {
    let harness = start_engine(single_shard_config()).await;
    let response = harness
        .engine
        .start_workflow_execution(start_request("w1", "start-1"))
        .await
        .unwrap();

    let answer = harness
        .engine
        .get_workflow_execution_next_event_id(GetWorkflowExecutionNextEventIdRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            run_id: None,
        })
        .await
        .unwrap();
    assert_eq!(answer.run_id, response.run_id);
    assert_eq!(answer.next_event_id, 2);
    assert_eq!(answer.task_list, "default");
}
