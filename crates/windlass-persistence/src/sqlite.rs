// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Records are stored as JSON blobs next to the columns the backend needs
//! for keys and compare-and-set checks. Every conditional write runs inside
//! a database transaction; CAS failures are classified from `rows_affected`
//! plus a re-read, never from error strings.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use windlass_api::CloseStatus;

use crate::error::{Result, StoreError};
use crate::store::{ExecutionStore, HistoryStore, ShardStore};
use crate::types::{
    ActivityInfo, AppendHistoryEventsRequest, ChildExecutionInfo, ContinueAsNewExecution,
    CreateWorkflowExecutionRequest, GetWorkflowExecutionRequest, ShardInfo, StoredHistoryBatch,
    TimerInfo, TimerTask, TransferTask, UpdateWorkflowExecutionRequest, WorkflowExecutionInfo,
    WorkflowMutableState,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. The caller is responsible for
    /// having run [`SqliteStore::migrate`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file as needed, connects
    /// with sensible defaults, and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Internal(format!("failed to create directory {parent:?}: {e}"))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| map_sqlx_err("connect", e))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Internal(format!("failed to run migrations: {e}")))?;

        Ok(Self { pool })
    }

    /// Run all migrations on a pool.
    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| StoreError::Internal(format!("failed to run migrations: {e}")))
    }
}

fn map_sqlx_err(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound(operation.to_string()),
        sqlx::Error::PoolTimedOut => StoreError::Timeout(operation.to_string()),
        other => StoreError::Internal(format!("{operation}: {other}")),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn from_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {micros}")))
}

fn close_status_str(status: CloseStatus) -> &'static str {
    match status {
        CloseStatus::None => "none",
        CloseStatus::Completed => "completed",
        CloseStatus::Failed => "failed",
        CloseStatus::Canceled => "canceled",
        CloseStatus::Terminated => "terminated",
        CloseStatus::ContinuedAsNew => "continued_as_new",
        CloseStatus::TimedOut => "timed_out",
    }
}

async fn check_range(
    tx: &mut sqlx::SqliteConnection,
    shard_id: u32,
    range_id: i64,
) -> Result<()> {
    let row = sqlx::query("SELECT range_id FROM shards WHERE shard_id = ?")
        .bind(i64::from(shard_id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("check_range", e))?
        .ok_or_else(|| StoreError::NotFound(format!("shard {shard_id}")))?;
    let stored_range: i64 = row
        .try_get("range_id")
        .map_err(|e| map_sqlx_err("check_range", e))?;
    if stored_range != range_id {
        return Err(StoreError::ShardOwnershipLost {
            shard_id,
            message: format!("request range {range_id} does not match shard range {stored_range}"),
        });
    }
    Ok(())
}

async fn insert_execution_row(
    tx: &mut sqlx::SqliteConnection,
    shard_id: u32,
    info: &WorkflowExecutionInfo,
    activities: &HashMap<i64, ActivityInfo>,
    timers: &HashMap<String, TimerInfo>,
    children: &HashMap<i64, ChildExecutionInfo>,
) -> Result<()> {
    // Pending maps serialize as value lists; keys are rebuilt on load.
    let activity_values: Vec<&ActivityInfo> = activities.values().collect();
    let timer_values: Vec<&TimerInfo> = timers.values().collect();
    let child_values: Vec<&ChildExecutionInfo> = children.values().collect();

    sqlx::query(
        r#"
        INSERT INTO executions (
            domain_id, workflow_id, run_id, shard_id, next_event_id, close_status,
            execution_info, activity_infos, timer_infos, child_execution_infos
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&info.domain_id)
    .bind(&info.workflow_id)
    .bind(&info.run_id)
    .bind(i64::from(shard_id))
    .bind(info.next_event_id)
    .bind(close_status_str(info.close_status))
    .bind(to_json(info)?)
    .bind(to_json(&activity_values)?)
    .bind(to_json(&timer_values)?)
    .bind(to_json(&child_values)?)
    .execute(&mut *tx)
    .await
    .map_err(|e| map_sqlx_err("insert_execution", e))?;

    sqlx::query(
        r#"
        INSERT INTO current_executions (domain_id, workflow_id, run_id)
        VALUES (?, ?, ?)
        ON CONFLICT (domain_id, workflow_id) DO UPDATE SET run_id = excluded.run_id
        "#,
    )
    .bind(&info.domain_id)
    .bind(&info.workflow_id)
    .bind(&info.run_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| map_sqlx_err("upsert_current_execution", e))?;

    Ok(())
}

async fn enqueue_tasks(
    tx: &mut sqlx::SqliteConnection,
    shard_id: u32,
    transfer_tasks: &[TransferTask],
    timer_tasks: &[TimerTask],
) -> Result<()> {
    for task in transfer_tasks {
        sqlx::query("INSERT INTO transfer_tasks (shard_id, task_id, data) VALUES (?, ?, ?)")
            .bind(i64::from(shard_id))
            .bind(task.task_id)
            .bind(to_json(task)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_err("insert_transfer_task", e))?;
    }
    for task in timer_tasks {
        sqlx::query(
            "INSERT INTO timer_tasks (shard_id, visibility_time_micros, task_id, data) VALUES (?, ?, ?, ?)",
        )
        .bind(i64::from(shard_id))
        .bind(to_micros(task.visibility_time))
        .bind(task.task_id)
        .bind(to_json(task)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("insert_timer_task", e))?;
    }
    Ok(())
}

#[async_trait]
impl ShardStore for SqliteStore {
    async fn create_shard(&self, shard: ShardInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO shards (
                shard_id, owner, range_id, stolen_since_renew,
                transfer_ack_level, timer_ack_level_micros, updated_at_micros
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(i64::from(shard.shard_id))
        .bind(&shard.owner)
        .bind(shard.range_id)
        .bind(i64::from(shard.stolen_since_renew))
        .bind(shard.transfer_ack_level)
        .bind(to_micros(shard.timer_ack_level))
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("create_shard", e))?;
        Ok(())
    }

    async fn get_shard(&self, shard_id: u32) -> Result<ShardInfo> {
        let row = sqlx::query(
            r#"
            SELECT owner, range_id, stolen_since_renew, transfer_ack_level, timer_ack_level_micros
            FROM shards WHERE shard_id = ?
            "#,
        )
        .bind(i64::from(shard_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("get_shard", e))?
        .ok_or_else(|| StoreError::NotFound(format!("shard {shard_id}")))?;

        let stolen: i64 = row
            .try_get("stolen_since_renew")
            .map_err(|e| map_sqlx_err("get_shard", e))?;
        Ok(ShardInfo {
            shard_id,
            owner: row.try_get("owner").map_err(|e| map_sqlx_err("get_shard", e))?,
            range_id: row
                .try_get("range_id")
                .map_err(|e| map_sqlx_err("get_shard", e))?,
            stolen_since_renew: stolen as i32,
            transfer_ack_level: row
                .try_get("transfer_ack_level")
                .map_err(|e| map_sqlx_err("get_shard", e))?,
            timer_ack_level: from_micros(
                row.try_get("timer_ack_level_micros")
                    .map_err(|e| map_sqlx_err("get_shard", e))?,
            )?,
        })
    }

    async fn update_shard(&self, shard: ShardInfo, previous_range_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE shards
            SET owner = ?, range_id = ?, stolen_since_renew = ?,
                transfer_ack_level = ?, timer_ack_level_micros = ?, updated_at_micros = ?
            WHERE shard_id = ? AND range_id = ?
            "#,
        )
        .bind(&shard.owner)
        .bind(shard.range_id)
        .bind(i64::from(shard.stolen_since_renew))
        .bind(shard.transfer_ack_level)
        .bind(to_micros(shard.timer_ack_level))
        .bind(to_micros(Utc::now()))
        .bind(i64::from(shard.shard_id))
        .bind(previous_range_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("update_shard", e))?;

        if result.rows_affected() == 0 {
            let current = self.get_shard(shard.shard_id).await?;
            return Err(StoreError::ShardOwnershipLost {
                shard_id: shard.shard_id,
                message: format!(
                    "stored range {} does not match expected {}",
                    current.range_id, previous_range_id
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_workflow_execution(&self, req: CreateWorkflowExecutionRequest) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("create_workflow_execution", e))?;
        check_range(&mut tx, req.shard_id, req.range_id).await?;

        let info = &req.execution_info;
        let current = sqlx::query(
            "SELECT run_id FROM current_executions WHERE domain_id = ? AND workflow_id = ?",
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("create_workflow_execution", e))?;

        if let Some(row) = current {
            let run_id: String = row
                .try_get("run_id")
                .map_err(|e| map_sqlx_err("create_workflow_execution", e))?;
            let existing = sqlx::query(
                r#"
                SELECT close_status, execution_info FROM executions
                WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
                "#,
            )
            .bind(&info.domain_id)
            .bind(&info.workflow_id)
            .bind(&run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_err("create_workflow_execution", e))?;

            if let Some(existing) = existing {
                let close_status: String = existing
                    .try_get("close_status")
                    .map_err(|e| map_sqlx_err("create_workflow_execution", e))?;
                if close_status == "none" {
                    let stored: WorkflowExecutionInfo = from_json(
                        existing
                            .try_get::<Vec<u8>, _>("execution_info")
                            .map_err(|e| map_sqlx_err("create_workflow_execution", e))?
                            .as_slice(),
                    )?;
                    return Err(StoreError::WorkflowExecutionAlreadyStarted {
                        workflow_id: info.workflow_id.clone(),
                        start_request_id: stored.start_request_id,
                        run_id,
                    });
                }
            }
        }

        insert_execution_row(
            &mut tx,
            req.shard_id,
            info,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        )
        .await?;
        enqueue_tasks(&mut tx, req.shard_id, &req.transfer_tasks, &req.timer_tasks).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("create_workflow_execution", e))?;
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        req: GetWorkflowExecutionRequest,
    ) -> Result<WorkflowMutableState> {
        let row = sqlx::query(
            r#"
            SELECT execution_info, activity_infos, timer_infos, child_execution_infos
            FROM executions
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(&req.domain_id)
        .bind(&req.workflow_id)
        .bind(&req.run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("get_workflow_execution", e))?
        .ok_or_else(|| {
            StoreError::NotFound(format!("execution {}/{}", req.workflow_id, req.run_id))
        })?;

        let get_blob = |name: &str| -> Result<Vec<u8>> {
            row.try_get::<Vec<u8>, _>(name)
                .map_err(|e| map_sqlx_err("get_workflow_execution", e))
        };
        let execution_info: WorkflowExecutionInfo = from_json(&get_blob("execution_info")?)?;
        let activities: Vec<ActivityInfo> = from_json(&get_blob("activity_infos")?)?;
        let timers: Vec<TimerInfo> = from_json(&get_blob("timer_infos")?)?;
        let children: Vec<ChildExecutionInfo> = from_json(&get_blob("child_execution_infos")?)?;

        Ok(WorkflowMutableState {
            execution_info,
            activity_infos: activities.into_iter().map(|a| (a.schedule_id, a)).collect(),
            timer_infos: timers.into_iter().map(|t| (t.timer_id.clone(), t)).collect(),
            child_execution_infos: children.into_iter().map(|c| (c.initiated_id, c)).collect(),
        })
    }

    async fn update_workflow_execution(&self, req: UpdateWorkflowExecutionRequest) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("update_workflow_execution", e))?;
        check_range(&mut tx, req.shard_id, req.range_id).await?;

        let info = &req.execution_info;
        let row = sqlx::query(
            r#"
            SELECT next_event_id, activity_infos, timer_infos, child_execution_infos
            FROM executions
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("update_workflow_execution", e))?
        .ok_or_else(|| {
            StoreError::NotFound(format!("execution {}/{}", info.workflow_id, info.run_id))
        })?;

        let stored_next_event_id: i64 = row
            .try_get("next_event_id")
            .map_err(|e| map_sqlx_err("update_workflow_execution", e))?;
        if stored_next_event_id != req.condition {
            return Err(StoreError::ConditionFailed(format!(
                "next event id {} does not match condition {}",
                stored_next_event_id, req.condition
            )));
        }

        let get_blob = |name: &str| -> Result<Vec<u8>> {
            row.try_get::<Vec<u8>, _>(name)
                .map_err(|e| map_sqlx_err("update_workflow_execution", e))
        };
        let mut activities: HashMap<i64, ActivityInfo> =
            from_json::<Vec<ActivityInfo>>(&get_blob("activity_infos")?)?
                .into_iter()
                .map(|a| (a.schedule_id, a))
                .collect();
        let mut timers: HashMap<String, TimerInfo> =
            from_json::<Vec<TimerInfo>>(&get_blob("timer_infos")?)?
                .into_iter()
                .map(|t| (t.timer_id.clone(), t))
                .collect();
        let mut children: HashMap<i64, ChildExecutionInfo> =
            from_json::<Vec<ChildExecutionInfo>>(&get_blob("child_execution_infos")?)?
                .into_iter()
                .map(|c| (c.initiated_id, c))
                .collect();

        for activity in &req.upsert_activity_infos {
            activities.insert(activity.schedule_id, activity.clone());
        }
        if let Some(schedule_id) = req.delete_activity_info {
            activities.remove(&schedule_id);
        }
        for timer in &req.upsert_timer_infos {
            timers.insert(timer.timer_id.clone(), timer.clone());
        }
        for timer_id in &req.delete_timer_infos {
            timers.remove(timer_id);
        }
        for child in &req.upsert_child_execution_infos {
            children.insert(child.initiated_id, child.clone());
        }
        if let Some(initiated_id) = req.delete_child_execution_info {
            children.remove(&initiated_id);
        }

        let activity_values: Vec<&ActivityInfo> = activities.values().collect();
        let timer_values: Vec<&TimerInfo> = timers.values().collect();
        let child_values: Vec<&ChildExecutionInfo> = children.values().collect();
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET next_event_id = ?, close_status = ?, execution_info = ?,
                activity_infos = ?, timer_infos = ?, child_execution_infos = ?
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ? AND next_event_id = ?
            "#,
        )
        .bind(info.next_event_id)
        .bind(close_status_str(info.close_status))
        .bind(to_json(info)?)
        .bind(to_json(&activity_values)?)
        .bind(to_json(&timer_values)?)
        .bind(to_json(&child_values)?)
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .bind(req.condition)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("update_workflow_execution", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed(format!(
                "condition {} no longer holds",
                req.condition
            )));
        }

        enqueue_tasks(&mut tx, req.shard_id, &req.transfer_tasks, &req.timer_tasks).await?;

        if let Some(ContinueAsNewExecution {
            execution_info: new_info,
            transfer_tasks,
            timer_tasks,
        }) = &req.continue_as_new
        {
            insert_execution_row(
                &mut tx,
                req.shard_id,
                new_info,
                &HashMap::new(),
                &HashMap::new(),
                &HashMap::new(),
            )
            .await?;
            enqueue_tasks(&mut tx, req.shard_id, transfer_tasks, timer_tasks).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("update_workflow_execution", e))?;
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("delete_workflow_execution", e))?;
        sqlx::query(
            "DELETE FROM executions WHERE domain_id = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("delete_workflow_execution", e))?;
        sqlx::query(
            "DELETE FROM current_executions WHERE domain_id = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("delete_workflow_execution", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("delete_workflow_execution", e))?;
        Ok(())
    }

    async fn get_current_run_id(&self, domain_id: &str, workflow_id: &str) -> Result<String> {
        let row = sqlx::query(
            "SELECT run_id FROM current_executions WHERE domain_id = ? AND workflow_id = ?",
        )
        .bind(domain_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("get_current_run_id", e))?
        .ok_or_else(|| StoreError::NotFound(format!("workflow {workflow_id}")))?;
        row.try_get("run_id")
            .map_err(|e| map_sqlx_err("get_current_run_id", e))
    }

    async fn get_transfer_tasks(
        &self,
        shard_id: u32,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTask>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM transfer_tasks
            WHERE shard_id = ? AND task_id > ? AND task_id <= ?
            ORDER BY task_id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::from(shard_id))
        .bind(read_level)
        .bind(max_read_level)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("get_transfer_tasks", e))?;

        rows.into_iter()
            .map(|row| {
                let data: Vec<u8> = row
                    .try_get("data")
                    .map_err(|e| map_sqlx_err("get_transfer_tasks", e))?;
                from_json(&data)
            })
            .collect()
    }

    async fn complete_transfer_task(&self, shard_id: u32, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM transfer_tasks WHERE shard_id = ? AND task_id = ?")
            .bind(i64::from(shard_id))
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_err("complete_transfer_task", e))?;
        Ok(())
    }

    async fn get_timer_tasks(
        &self,
        shard_id: u32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTask>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM timer_tasks
            WHERE shard_id = ? AND visibility_time_micros >= ? AND visibility_time_micros <= ?
            ORDER BY visibility_time_micros ASC, task_id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::from(shard_id))
        .bind(to_micros(min_time))
        .bind(to_micros(max_time))
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("get_timer_tasks", e))?;

        rows.into_iter()
            .map(|row| {
                let data: Vec<u8> = row
                    .try_get("data")
                    .map_err(|e| map_sqlx_err("get_timer_tasks", e))?;
                from_json(&data)
            })
            .collect()
    }

    async fn complete_timer_task(
        &self,
        shard_id: u32,
        visibility_time: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM timer_tasks WHERE shard_id = ? AND visibility_time_micros = ? AND task_id = ?",
        )
        .bind(i64::from(shard_id))
        .bind(to_micros(visibility_time))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("complete_timer_task", e))?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn append_history_events(&self, req: AppendHistoryEventsRequest) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("append_history_events", e))?;
        check_range(&mut tx, req.shard_id, req.range_id).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO history_events (domain_id, workflow_id, run_id, first_event_id, transaction_id, data)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (domain_id, workflow_id, run_id, first_event_id) DO NOTHING
            "#,
        )
        .bind(&req.domain_id)
        .bind(&req.workflow_id)
        .bind(&req.run_id)
        .bind(req.first_event_id)
        .bind(req.transaction_id)
        .bind(&req.events)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("append_history_events", e))?;

        if inserted.rows_affected() == 0 {
            if !req.overwrite {
                return Err(StoreError::ConditionFailed(format!(
                    "batch at event {} already written",
                    req.first_event_id
                )));
            }
            sqlx::query(
                r#"
                UPDATE history_events SET transaction_id = ?, data = ?
                WHERE domain_id = ? AND workflow_id = ? AND run_id = ? AND first_event_id = ?
                "#,
            )
            .bind(req.transaction_id)
            .bind(&req.events)
            .bind(&req.domain_id)
            .bind(&req.workflow_id)
            .bind(&req.run_id)
            .bind(req.first_event_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_err("append_history_events", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("append_history_events", e))?;
        Ok(())
    }

    async fn get_workflow_execution_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Vec<StoredHistoryBatch>> {
        let rows = sqlx::query(
            r#"
            SELECT first_event_id, transaction_id, data FROM history_events
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            ORDER BY first_event_id ASC
            "#,
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("get_workflow_execution_history", e))?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredHistoryBatch {
                    first_event_id: row
                        .try_get("first_event_id")
                        .map_err(|e| map_sqlx_err("get_workflow_execution_history", e))?,
                    transaction_id: row
                        .try_get("transaction_id")
                        .map_err(|e| map_sqlx_err("get_workflow_execution_history", e))?,
                    data: row
                        .try_get("data")
                        .map_err(|e| map_sqlx_err("get_workflow_execution_history", e))?,
                })
            })
            .collect()
    }

    async fn delete_workflow_execution_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM history_events WHERE domain_id = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("delete_workflow_execution_history", e))?;
        Ok(())
    }
}
