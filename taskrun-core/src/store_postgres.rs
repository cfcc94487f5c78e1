use crate::events::RunEvent;
use crate::store::{RunStore, StoreError};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// PostgreSQL-backed implementation of `RunStore`.
///
/// Claims take `FOR UPDATE SKIP LOCKED` row locks so any number of
/// dispatcher processes can share one database without double-claiming.
/// Every status UPDATE carries its legal predecessor statuses in the WHERE
/// clause: an illegal transition affects zero rows and is surfaced as
/// `StoreError::IllegalTransition` instead of corrupting state.
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }
}

// ─── Column conversions ───────────────────────────────────────

fn epoch_ms_to_datetime(epoch_ms: Timestamp) -> DateTime<Utc> {
    let secs = epoch_ms / 1000;
    let nanos = ((epoch_ms % 1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
}

fn task_status_str(status: TaskRunStatus) -> &'static str {
    match status {
        TaskRunStatus::Queued => "queued",
        TaskRunStatus::Processing => "processing",
        TaskRunStatus::Suspended => "suspended",
        TaskRunStatus::Completed => "completed",
        TaskRunStatus::Failed => "failed",
    }
}

fn stack_status_str(status: StackRunStatus) -> &'static str {
    match status {
        StackRunStatus::Pending => "pending",
        StackRunStatus::Processing => "processing",
        StackRunStatus::SuspendedWaitingChild => "suspended_waiting_child",
        StackRunStatus::PendingResume => "pending_resume",
        StackRunStatus::Completed => "completed",
        StackRunStatus::Failed => "failed",
    }
}

fn task_status_from_str(s: &str) -> Result<TaskRunStatus, StoreError> {
    Ok(serde_json::from_value(Value::String(s.to_string()))?)
}

fn stack_status_from_str(s: &str) -> Result<StackRunStatus, StoreError> {
    Ok(serde_json::from_value(Value::String(s.to_string()))?)
}

fn opt_json<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
) -> Result<Option<T>, StoreError> {
    value.map(serde_json::from_value).transpose().map_err(Into::into)
}

fn args_from_json(value: Value) -> Result<Vec<Value>, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn ms(dt: DateTime<Utc>) -> Timestamp {
    dt.timestamp_millis()
}

fn task_run_from_row(row: &PgRow) -> Result<TaskRun, StoreError> {
    let status: String = row.get("status");
    let ended_at: Option<DateTime<Utc>> = row.get("ended_at");
    Ok(TaskRun {
        id: row.get("id"),
        task_name: row.get("task_name"),
        input: row.get("input"),
        status: task_status_from_str(&status)?,
        result: row.get("result"),
        error: opt_json(row.get("error"))?,
        root_stack_run_id: row.get("root_stack_run_id"),
        waiting_on_stack_run_id: row.get("waiting_on_stack_run_id"),
        created_at: ms(row.get("created_at")),
        updated_at: ms(row.get("updated_at")),
        ended_at: ended_at.map(ms),
    })
}

fn stack_run_from_row(row: &PgRow) -> Result<StackRun, StoreError> {
    let status: String = row.get("status");
    let ended_at: Option<DateTime<Utc>> = row.get("ended_at");
    Ok(StackRun {
        id: row.get("id"),
        parent_task_run_id: row.get("parent_task_run_id"),
        parent_stack_run_id: row.get("parent_stack_run_id"),
        root_of_task_run_id: row.get("root_of_task_run_id"),
        service_name: row.get("service_name"),
        method_name: row.get("method_name"),
        args: args_from_json(row.get("args"))?,
        status: stack_status_from_str(&status)?,
        result: row.get("result"),
        error: opt_json(row.get("error"))?,
        vm_state: opt_json(row.get("vm_state"))?,
        resume_payload: row.get("resume_payload"),
        waiting_on_stack_run_id: row.get("waiting_on_stack_run_id"),
        created_at: ms(row.get("created_at")),
        updated_at: ms(row.get("updated_at")),
        ended_at: ended_at.map(ms),
    })
}

const STACK_RUN_COLUMNS: &str = "id, parent_task_run_id, parent_stack_run_id, \
     root_of_task_run_id, service_name, method_name, args, status, result, \
     error, vm_state, resume_payload, waiting_on_stack_run_id, created_at, \
     updated_at, ended_at";

// ─── Shared transaction steps ─────────────────────────────────

async fn insert_stack_run(
    tx: &mut Transaction<'_, Postgres>,
    run: &StackRun,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO stack_runs (
            id, parent_task_run_id, parent_stack_run_id, root_of_task_run_id,
            service_name, method_name, args, status, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(run.id)
    .bind(run.parent_task_run_id)
    .bind(run.parent_stack_run_id)
    .bind(run.root_of_task_run_id)
    .bind(&run.service_name)
    .bind(&run.method_name)
    .bind(Value::Array(run.args.clone()))
    .bind(stack_status_str(run.status))
    .bind(epoch_ms_to_datetime(run.created_at))
    .bind(epoch_ms_to_datetime(run.updated_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_task_run(
    tx: &mut Transaction<'_, Postgres>,
    task: &TaskRun,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO task_runs (
            id, task_name, input, status, root_stack_run_id, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(task.id)
    .bind(&task.task_name)
    .bind(&task.input)
    .bind(task_status_str(task.status))
    .bind(task.root_stack_run_id)
    .bind(epoch_ms_to_datetime(task.created_at))
    .bind(epoch_ms_to_datetime(task.updated_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Terminal task-run writes are guarded by status: an already ended task
/// run is left untouched, keeping terminal fields write-once.
async fn finish_task(
    tx: &mut Transaction<'_, Postgres>,
    task_id: TaskRunId,
    status: TaskRunStatus,
    result: Option<&Value>,
    error: Option<&RunError>,
) -> Result<(), StoreError> {
    let error_json = error.map(serde_json::to_value).transpose()?;
    let updated = sqlx::query(
        r#"
        UPDATE task_runs
        SET status = $2, result = $3, error = $4,
            waiting_on_stack_run_id = NULL, updated_at = now(), ended_at = now()
        WHERE id = $1 AND status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(task_id)
    .bind(task_status_str(status))
    .bind(result.cloned())
    .bind(error_json)
    .execute(&mut **tx)
    .await?;
    if updated.rows_affected() == 0 {
        tracing::warn!(%task_id, ?status, "ignoring terminal write to ended task run");
    }
    Ok(())
}

/// Mark a task run `processing` on claim of its root frame.
async fn task_claimed(
    tx: &mut Transaction<'_, Postgres>,
    task_id: TaskRunId,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE task_runs
        SET status = 'processing', waiting_on_stack_run_id = NULL, updated_at = now()
        WHERE id = $1 AND status IN ('queued', 'suspended', 'processing')
        "#,
    )
    .bind(task_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn claim_row(
    tx: &mut Transaction<'_, Postgres>,
    id: StackRunId,
) -> Result<Option<StackRun>, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE stack_runs
        SET status = 'processing', updated_at = now()
        WHERE id = $1
        RETURNING {STACK_RUN_COLUMNS}
        "#
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        None => Ok(None),
        Some(row) => {
            let run = stack_run_from_row(&row)?;
            if let Some(task_id) = run.root_of_task_run_id {
                task_claimed(tx, task_id).await?;
            }
            Ok(Some(run))
        }
    }
}

/// Resolve the current status of a row to build a precise
/// `IllegalTransition` error after a guarded UPDATE matched nothing.
async fn explain_rejected_transition(
    pool: &PgPool,
    id: StackRunId,
    to: StackRunStatus,
) -> StoreError {
    let current: Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT status FROM stack_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await;
    match current {
        Ok(Some(status)) => match stack_status_from_str(&status) {
            Ok(from) => StoreError::IllegalTransition { id, from, to },
            Err(err) => err,
        },
        Ok(None) => StoreError::StackRunNotFound(id),
        Err(err) => StoreError::Database(err),
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    // ── Creation ──

    async fn create_task_run(&self, task_name: &str, input: Value) -> Result<TaskRun, StoreError> {
        let now = now_ms();
        let task_id = Uuid::now_v7();
        let root_id = Uuid::now_v7();

        let task = TaskRun {
            id: task_id,
            task_name: task_name.to_string(),
            input: input.clone(),
            status: TaskRunStatus::Queued,
            result: None,
            error: None,
            root_stack_run_id: root_id,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        let root = StackRun {
            id: root_id,
            parent_task_run_id: task_id,
            parent_stack_run_id: None,
            root_of_task_run_id: Some(task_id),
            service_name: TASKS_SERVICE.to_string(),
            method_name: EXECUTE_METHOD.to_string(),
            args: vec![Value::String(task_name.to_string()), input],
            status: StackRunStatus::Pending,
            result: None,
            error: None,
            vm_state: None,
            resume_payload: None,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };

        let mut tx = self.pool.begin().await?;
        insert_task_run(&mut tx, &task).await?;
        insert_stack_run(&mut tx, &root).await?;
        tx.commit().await?;
        Ok(task)
    }

    // ── Claims ──

    async fn claim_next_ready(&self) -> Result<Option<StackRun>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM stack_runs
            WHERE status IN ('pending', 'pending_resume')
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let claimed = match id {
            None => None,
            Some(id) => claim_row(&mut tx, id).await?,
        };
        tx.commit().await?;
        Ok(claimed)
    }

    async fn claim_specific(&self, id: StackRunId) -> Result<Option<StackRun>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let locked: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM stack_runs
            WHERE id = $1 AND status IN ('pending', 'pending_resume')
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let claimed = match locked {
            None => None,
            Some(id) => claim_row(&mut tx, id).await?,
        };
        tx.commit().await?;
        Ok(claimed)
    }

    // ── Transitions ──

    async fn suspend(
        &self,
        stack_run_id: StackRunId,
        continuation: &Continuation,
        child: &ChildSpec,
    ) -> Result<StackRun, StoreError> {
        let now = now_ms();
        let child_id = Uuid::now_v7();
        let vm_state = serde_json::to_value(continuation)?;

        let mut tx = self.pool.begin().await?;
        let parent = sqlx::query(
            r#"
            UPDATE stack_runs
            SET status = 'suspended_waiting_child', vm_state = $2,
                waiting_on_stack_run_id = $3, resume_payload = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'processing'
            RETURNING parent_task_run_id, root_of_task_run_id
            "#,
        )
        .bind(stack_run_id)
        .bind(&vm_state)
        .bind(child_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(parent) = parent else {
            tx.rollback().await?;
            return Err(explain_rejected_transition(
                &self.pool,
                stack_run_id,
                StackRunStatus::SuspendedWaitingChild,
            )
            .await);
        };
        let parent_task: Uuid = parent.get("parent_task_run_id");
        let parent_root_of: Option<Uuid> = parent.get("root_of_task_run_id");

        let child_run = StackRun {
            id: child_id,
            parent_task_run_id: parent_task,
            parent_stack_run_id: Some(stack_run_id),
            root_of_task_run_id: None,
            service_name: child.service.clone(),
            method_name: child.method.clone(),
            args: child.args.clone(),
            status: StackRunStatus::Pending,
            result: None,
            error: None,
            vm_state: None,
            resume_payload: None,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        insert_stack_run(&mut tx, &child_run).await?;

        if let Some(task_id) = parent_root_of {
            sqlx::query(
                r#"
                UPDATE task_runs
                SET status = 'suspended', waiting_on_stack_run_id = $2, updated_at = now()
                WHERE id = $1 AND status NOT IN ('completed', 'failed')
                "#,
            )
            .bind(task_id)
            .bind(child_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(child_run)
    }

    async fn spawn_child_task(
        &self,
        stack_run_id: StackRunId,
        task_name: &str,
        input: Value,
    ) -> Result<(TaskRun, StackRun), StoreError> {
        let now = now_ms();
        let child_task_id = Uuid::now_v7();
        let child_root_id = Uuid::now_v7();

        let mut tx = self.pool.begin().await?;
        let frame = sqlx::query(
            r#"
            UPDATE stack_runs
            SET status = 'suspended_waiting_child',
                waiting_on_stack_run_id = $2, updated_at = now()
            WHERE id = $1 AND status = 'processing'
            RETURNING parent_task_run_id
            "#,
        )
        .bind(stack_run_id)
        .bind(child_root_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(frame) = frame else {
            tx.rollback().await?;
            return Err(explain_rejected_transition(
                &self.pool,
                stack_run_id,
                StackRunStatus::SuspendedWaitingChild,
            )
            .await);
        };
        let frame_task: Uuid = frame.get("parent_task_run_id");

        let child_task = TaskRun {
            id: child_task_id,
            task_name: task_name.to_string(),
            input: input.clone(),
            status: TaskRunStatus::Queued,
            result: None,
            error: None,
            root_stack_run_id: child_root_id,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        let child_root = StackRun {
            id: child_root_id,
            parent_task_run_id: frame_task,
            parent_stack_run_id: Some(stack_run_id),
            root_of_task_run_id: Some(child_task_id),
            service_name: TASKS_SERVICE.to_string(),
            method_name: EXECUTE_METHOD.to_string(),
            args: vec![Value::String(task_name.to_string()), input],
            status: StackRunStatus::Pending,
            result: None,
            error: None,
            vm_state: None,
            resume_payload: None,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };

        insert_task_run(&mut tx, &child_task).await?;
        insert_stack_run(&mut tx, &child_root).await?;
        tx.commit().await?;
        Ok((child_task, child_root))
    }

    async fn complete(
        &self,
        stack_run_id: StackRunId,
        result: Value,
    ) -> Result<Option<StackRunId>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE stack_runs
            SET status = 'completed', result = $2, resume_payload = NULL,
                waiting_on_stack_run_id = NULL, updated_at = now(), ended_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING parent_stack_run_id, root_of_task_run_id
            "#,
        )
        .bind(stack_run_id)
        .bind(&result)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(explain_rejected_transition(
                &self.pool,
                stack_run_id,
                StackRunStatus::Completed,
            )
            .await);
        };
        let parent_id: Option<Uuid> = row.get("parent_stack_run_id");
        let root_of: Option<Uuid> = row.get("root_of_task_run_id");

        if let Some(task_id) = root_of {
            finish_task(&mut tx, task_id, TaskRunStatus::Completed, Some(&result), None).await?;
        }

        // The child's result is committed in the same transaction, strictly
        // before the parent flip becomes visible.
        let mut resumed = None;
        if let Some(pid) = parent_id {
            let updated = sqlx::query(
                r#"
                UPDATE stack_runs
                SET status = 'pending_resume', resume_payload = $2,
                    waiting_on_stack_run_id = NULL, updated_at = now()
                WHERE id = $1 AND status = 'suspended_waiting_child'
                  AND waiting_on_stack_run_id = $3
                "#,
            )
            .bind(pid)
            .bind(&result)
            .bind(stack_run_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                resumed = Some(pid);
            } else {
                let exists: Option<i32> =
                    sqlx::query_scalar("SELECT 1 FROM stack_runs WHERE id = $1")
                        .bind(pid)
                        .fetch_optional(&mut *tx)
                        .await?;
                if exists.is_none() {
                    tx.rollback().await?;
                    return Err(StoreError::OrphanedFrame {
                        child: stack_run_id,
                        parent: pid,
                    });
                }
                tracing::warn!(
                    child = %stack_run_id,
                    parent = %pid,
                    "completed child has no waiting parent; result not delivered"
                );
            }
        }

        tx.commit().await?;
        Ok(resumed)
    }

    async fn fail(
        &self,
        stack_run_id: StackRunId,
        error: &RunError,
    ) -> Result<TaskRunId, StoreError> {
        let mut original = error.clone();
        if original.failed_stack_run_id.is_none() {
            original.failed_stack_run_id = Some(stack_run_id);
        }
        let original_json = serde_json::to_value(&original)?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE stack_runs
            SET status = 'failed', error = $2, waiting_on_stack_run_id = NULL,
                updated_at = now(), ended_at = now()
            WHERE id = $1
              AND status IN ('pending', 'processing', 'suspended_waiting_child')
            RETURNING parent_task_run_id, parent_stack_run_id, root_of_task_run_id
            "#,
        )
        .bind(stack_run_id)
        .bind(&original_json)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(explain_rejected_transition(
                &self.pool,
                stack_run_id,
                StackRunStatus::Failed,
            )
            .await);
        };
        let enclosing: Uuid = row.get("parent_task_run_id");
        let root_of: Option<Uuid> = row.get("root_of_task_run_id");
        let mut cursor: Option<Uuid> = row.get("parent_stack_run_id");

        if let Some(task_id) = root_of {
            finish_task(&mut tx, task_id, TaskRunStatus::Failed, None, Some(&original)).await?;
        }

        // Ancestors: still-suspended frames fail with a wrapped error, task
        // runs rooted along the way fail with the original. Stop at the
        // first ancestor that is not waiting.
        let mut child_id = stack_run_id;
        let mut child_err = original.clone();
        while let Some(pid) = cursor {
            let parent = sqlx::query(
                r#"
                SELECT status, parent_stack_run_id, root_of_task_run_id
                FROM stack_runs WHERE id = $1
                FOR UPDATE
                "#,
            )
            .bind(pid)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(parent) = parent else {
                // Structural corruption: fail the root task run with a
                // diagnostic naming the offending id.
                tracing::error!(child = %child_id, parent = %pid, "stack run names missing parent");
                let diag = RunError::internal(format!(
                    "stack run {child_id} names missing parent {pid}"
                ));
                finish_task(&mut tx, enclosing, TaskRunStatus::Failed, None, Some(&diag)).await?;
                break;
            };
            let status: String = parent.get("status");
            if stack_status_from_str(&status)? != StackRunStatus::SuspendedWaitingChild {
                break;
            }

            let wrapped = RunError::propagated(child_id, child_err);
            sqlx::query(
                r#"
                UPDATE stack_runs
                SET status = 'failed', error = $2, waiting_on_stack_run_id = NULL,
                    updated_at = now(), ended_at = now()
                WHERE id = $1
                "#,
            )
            .bind(pid)
            .bind(serde_json::to_value(&wrapped)?)
            .execute(&mut *tx)
            .await?;

            let parent_root_of: Option<Uuid> = parent.get("root_of_task_run_id");
            if let Some(task_id) = parent_root_of {
                finish_task(&mut tx, task_id, TaskRunStatus::Failed, None, Some(&original))
                    .await?;
            }

            child_id = pid;
            child_err = wrapped;
            cursor = parent.get("parent_stack_run_id");
        }

        tx.commit().await?;
        Ok(enclosing)
    }

    // ── Reads ──

    async fn get_task_run(&self, id: TaskRunId) -> Result<Option<TaskRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, task_name, input, status, result, error,
                   root_stack_run_id, waiting_on_stack_run_id,
                   created_at, updated_at, ended_at
            FROM task_runs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_run_from_row).transpose()
    }

    async fn get_stack_run(&self, id: StackRunId) -> Result<Option<StackRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STACK_RUN_COLUMNS} FROM stack_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stack_run_from_row).transpose()
    }

    // ── Audit trail ──

    async fn append_event(
        &self,
        task_run_id: TaskRunId,
        event: &RunEvent,
    ) -> Result<u64, StoreError> {
        let payload = serde_json::to_value(event)?;
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO run_events (task_run_id, event)
            VALUES ($1, $2)
            RETURNING seq
            "#,
        )
        .bind(task_run_id)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq as u64)
    }

    async fn read_events(
        &self,
        task_run_id: TaskRunId,
        from_seq: u64,
    ) -> Result<Vec<(u64, RunEvent)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, event FROM run_events
            WHERE task_run_id = $1 AND seq >= $2
            ORDER BY seq
            "#,
        )
        .bind(task_run_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let event: RunEvent = serde_json::from_value(row.get("event"))?;
                Ok((seq as u64, event))
            })
            .collect()
    }
}
