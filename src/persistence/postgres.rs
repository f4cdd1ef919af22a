//! PostgreSQL implementation of [`Store`].
//!
//! Uses `sqlx` transactions for the atomicity groups in spec §4.3 and
//! `FOR UPDATE SKIP LOCKED` for efficient concurrent claiming, the same
//! technique the teacher's Postgres task queue uses.
//!
//! Conforming DDL (see also spec §6 "Persisted state layout"):
//!
//! ```sql
//! CREATE TABLE executions (
//!     id UUID PRIMARY KEY,
//!     task_id TEXT NOT NULL,
//!     input JSONB NOT NULL,
//!     status TEXT NOT NULL,
//!     attempt INT NOT NULL DEFAULT 0,
//!     result JSONB,
//!     error JSONB,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     completed_at TIMESTAMPTZ,
//!     lease_owner TEXT,
//!     lease_id UUID,
//!     lease_expires_at TIMESTAMPTZ,
//!     wake_at TIMESTAMPTZ,
//!     pending_signal_id TEXT
//! );
//! CREATE TABLE step_results (
//!     execution_id UUID NOT NULL REFERENCES executions(id),
//!     step_id TEXT NOT NULL,
//!     kind TEXT NOT NULL,
//!     result JSONB,
//!     completed_at TIMESTAMPTZ,
//!     PRIMARY KEY (execution_id, step_id)
//! );
//! CREATE TABLE timers (
//!     execution_id UUID NOT NULL,
//!     step_id TEXT NOT NULL,
//!     wake_at TIMESTAMPTZ NOT NULL,
//!     reason TEXT NOT NULL,
//!     PRIMARY KEY (execution_id, step_id)
//! );
//! CREATE INDEX timers_wake_at_idx ON timers (wake_at);
//! CREATE TABLE signal_waiters (
//!     signal_id TEXT NOT NULL,
//!     execution_id UUID NOT NULL,
//!     step_id TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     deadline TIMESTAMPTZ,
//!     PRIMARY KEY (signal_id, execution_id, step_id)
//! );
//! CREATE TABLE notes (
//!     execution_id UUID NOT NULL,
//!     message TEXT NOT NULL,
//!     recorded_at TIMESTAMPTZ NOT NULL
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::model::{
    Execution, ExecutionError, ExecutionFilter, ExecutionStatus, NoteEntry, Pagination,
    StepKind, StepResult, Timer, TimerReason,
};

use super::store::{ClaimOptions, ClaimedExecution, ExecutionPatch, Store, StepResultWrite, StoreError};

/// PostgreSQL-backed [`Store`], built on a connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_to_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Sleeping => "sleeping",
        ExecutionStatus::WaitingForSignal => "waiting_for_signal",
        ExecutionStatus::Retrying => "retrying",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> Result<ExecutionStatus, StoreError> {
    Ok(match s {
        "pending" => ExecutionStatus::Pending,
        "running" => ExecutionStatus::Running,
        "sleeping" => ExecutionStatus::Sleeping,
        "waiting_for_signal" => ExecutionStatus::WaitingForSignal,
        "retrying" => ExecutionStatus::Retrying,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        "cancelled" => ExecutionStatus::Cancelled,
        other => return Err(StoreError::Backend(format!("unknown status `{other}`"))),
    })
}

fn kind_to_str(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Step => "step",
        StepKind::Sleep => "sleep",
        StepKind::SignalWait => "signal_wait",
        StepKind::Switch => "switch",
    }
}

fn kind_from_str(s: &str) -> Result<StepKind, StoreError> {
    Ok(match s {
        "step" => StepKind::Step,
        "sleep" => StepKind::Sleep,
        "signal_wait" => StepKind::SignalWait,
        "switch" => StepKind::Switch,
        other => return Err(StoreError::Backend(format!("unknown step kind `{other}`"))),
    })
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> Result<Execution, StoreError> {
    let status: String = row.try_get("status").map_err(StoreError::Sqlx)?;
    let error_json: Option<Value> = row.try_get("error").map_err(StoreError::Sqlx)?;
    Ok(Execution {
        id: row.try_get("id").map_err(StoreError::Sqlx)?,
        task_id: row.try_get("task_id").map_err(StoreError::Sqlx)?,
        input: row.try_get("input").map_err(StoreError::Sqlx)?,
        status: status_from_str(&status)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(StoreError::Sqlx)? as u32,
        result: row.try_get("result").map_err(StoreError::Sqlx)?,
        error: error_json.and_then(|v| serde_json::from_value::<ExecutionError>(v).ok()),
        created_at: row.try_get("created_at").map_err(StoreError::Sqlx)?,
        updated_at: row.try_get("updated_at").map_err(StoreError::Sqlx)?,
        completed_at: row.try_get("completed_at").map_err(StoreError::Sqlx)?,
        lease_owner: row.try_get("lease_owner").map_err(StoreError::Sqlx)?,
        lease_id: row.try_get("lease_id").map_err(StoreError::Sqlx)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(StoreError::Sqlx)?,
        wake_at: row.try_get("wake_at").map_err(StoreError::Sqlx)?,
        pending_signal_id: row.try_get("pending_signal_id").map_err(StoreError::Sqlx)?,
    })
}

fn step_result_from_row(row: &sqlx::postgres::PgRow) -> Result<StepResult, StoreError> {
    let kind: String = row.try_get("kind").map_err(StoreError::Sqlx)?;
    Ok(StepResult {
        execution_id: row.try_get("execution_id").map_err(StoreError::Sqlx)?,
        step_id: row.try_get("step_id").map_err(StoreError::Sqlx)?,
        kind: kind_from_str(&kind)?,
        result: row.try_get("result").map_err(StoreError::Sqlx)?,
        completed_at: row.try_get("completed_at").map_err(StoreError::Sqlx)?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, task_id, input, status, attempt, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.task_id)
        .bind(&execution.input)
        .bind(status_to_str(execution.status))
        .bind(execution.attempt as i32)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create execution: {e}");
            StoreError::Sqlx(e)
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?
            .ok_or(StoreError::NotFound(id))?;
        execution_from_row(&row)
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        paging: Pagination,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE ($1::text IS NULL OR task_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(filter.task_id)
        .bind(filter.status.map(status_to_str))
        .bind(paging.offset as i64)
        .bind(paging.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self, options), fields(%owner))]
    async fn claim(
        &self,
        owner: &str,
        options: ClaimOptions,
    ) -> Result<Option<ClaimedExecution>, StoreError> {
        let lease_id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT e.id,
                       CASE
                           WHEN EXISTS (
                               SELECT 1 FROM timers t
                               WHERE t.execution_id = e.id AND t.wake_at <= now()
                           ) THEN 0
                           WHEN e.pending_signal_id IS NOT NULL
                                AND e.status = 'waiting_for_signal'
                                AND NOT EXISTS (
                                    SELECT 1 FROM signal_waiters w
                                    WHERE w.execution_id = e.id
                                ) THEN 1
                           WHEN e.status IN ('pending', 'retrying')
                                AND (e.wake_at IS NULL OR e.wake_at <= now()) THEN 2
                           WHEN e.status = 'running' AND e.lease_expires_at <= now() THEN 3
                           ELSE NULL
                       END AS tier
                FROM executions e
                WHERE ($1::text IS NULL OR e.task_id = $1)
                  AND e.status NOT IN ('completed', 'failed', 'cancelled')
                ORDER BY tier ASC NULLS LAST, e.wake_at ASC NULLS LAST, e.created_at ASC
                LIMIT 1
                FOR UPDATE OF e SKIP LOCKED
            )
            UPDATE executions e
            SET status = 'running',
                lease_owner = $2,
                lease_id = $3,
                lease_expires_at = now() + interval '30 seconds',
                updated_at = now()
            FROM claimable c
            WHERE e.id = c.id AND c.tier IS NOT NULL
            RETURNING e.*
            "#,
        )
        .bind(options.task_id)
        .bind(owner)
        .bind(lease_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim execution: {e}");
            StoreError::Sqlx(e)
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let execution = execution_from_row(&row)?;
        debug!(execution_id = %execution.id, %lease_id, "claimed execution");
        Ok(Some(ClaimedExecution { execution, lease_id }))
    }

    async fn renew_lease(
        &self,
        execution_id: Uuid,
        lease_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET lease_expires_at = now() + ($3 || ' milliseconds')::interval
            WHERE id = $1 AND lease_id = $2 AND lease_expires_at > now()
            "#,
        )
        .bind(execution_id)
        .bind(lease_id)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, execution_id: Uuid, lease_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE executions
            SET lease_owner = NULL, lease_id = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_id = $2
            "#,
        )
        .bind(execution_id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    #[instrument(skip(self, write), fields(execution_id = %write.execution_id, step_id = %write.step_id))]
    async fn append_step_result(&self, write: StepResultWrite) -> Result<StepResult, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlx)?;

        let completed_at = write.result.is_some().then(Utc::now);
        let row = sqlx::query(
            r#"
            INSERT INTO step_results (execution_id, step_id, kind, result, completed_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(write.execution_id)
        .bind(&write.step_id)
        .bind(kind_to_str(write.kind))
        .bind(&write.result)
        .bind(completed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return StoreError::DuplicateStepId {
                        execution_id: write.execution_id,
                        step_id: write.step_id.clone(),
                    };
                }
            }
            StoreError::Sqlx(e)
        })?;

        if let Some(timer) = &write.arm_timer {
            sqlx::query(
                r#"
                INSERT INTO timers (execution_id, step_id, wake_at, reason)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(timer.execution_id)
            .bind(&timer.step_id)
            .bind(timer.wake_at)
            .bind(match timer.reason {
                TimerReason::Sleep => "sleep",
                TimerReason::SignalTimeout => "signal_timeout",
            })
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;
        }

        if let Some(waiter) = &write.arm_waiter {
            sqlx::query(
                r#"
                INSERT INTO signal_waiters (signal_id, execution_id, step_id, created_at, deadline)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&waiter.signal_id)
            .bind(waiter.execution_id)
            .bind(&waiter.step_id)
            .bind(waiter.created_at)
            .bind(waiter.deadline)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;
        }

        tx.commit().await.map_err(StoreError::Sqlx)?;
        step_result_from_row(&row)
    }

    async fn promote_waiting_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
        value: Value,
    ) -> Result<StepResult, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlx)?;

        let row = sqlx::query(
            r#"
            UPDATE step_results
            SET result = $3, completed_at = now()
            WHERE execution_id = $1 AND step_id = $2
            RETURNING *
            "#,
        )
        .bind(execution_id)
        .bind(step_id)
        .bind(&value)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::Sqlx)?
        .ok_or(StoreError::NotFound(execution_id))?;

        sqlx::query("DELETE FROM timers WHERE execution_id = $1 AND step_id = $2")
            .bind(execution_id)
            .bind(step_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;
        sqlx::query("DELETE FROM signal_waiters WHERE execution_id = $1 AND step_id = $2")
            .bind(execution_id)
            .bind(step_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

        tx.commit().await.map_err(StoreError::Sqlx)?;
        step_result_from_row(&row)
    }

    async fn list_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        let rows = sqlx::query("SELECT * FROM step_results WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;
        rows.iter().map(step_result_from_row).collect()
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError> {
        let rows = sqlx::query("SELECT * FROM timers WHERE wake_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;
        rows.into_iter()
            .map(|row| {
                let reason: String = row.try_get("reason").map_err(StoreError::Sqlx)?;
                Ok(Timer {
                    execution_id: row.try_get("execution_id").map_err(StoreError::Sqlx)?,
                    step_id: row.try_get("step_id").map_err(StoreError::Sqlx)?,
                    wake_at: row.try_get("wake_at").map_err(StoreError::Sqlx)?,
                    reason: match reason.as_str() {
                        "sleep" => TimerReason::Sleep,
                        "signal_timeout" => TimerReason::SignalTimeout,
                        other => {
                            return Err(StoreError::Backend(format!(
                                "unknown timer reason `{other}`"
                            )))
                        }
                    },
                })
            })
            .collect()
    }

    async fn cancel_timer(&self, execution_id: Uuid, step_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM timers WHERE execution_id = $1 AND step_id = $2")
            .bind(execution_id)
            .bind(step_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    #[instrument(skip(self, payload), fields(%signal_id))]
    async fn signal_ready(&self, signal_id: &str, payload: Value) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlx)?;

        let waiters = sqlx::query(
            "SELECT execution_id, step_id FROM signal_waiters WHERE signal_id = $1 FOR UPDATE",
        )
        .bind(signal_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::Sqlx)?;

        let mut affected = Vec::new();
        for waiter in waiters {
            let execution_id: Uuid = waiter.try_get("execution_id").map_err(StoreError::Sqlx)?;
            let step_id: String = waiter.try_get("step_id").map_err(StoreError::Sqlx)?;

            let envelope = serde_json::json!({ "kind": "signal", "data": payload.clone() });
            let updated = sqlx::query(
                r#"
                UPDATE step_results
                SET result = $3, completed_at = now()
                WHERE execution_id = $1 AND step_id = $2 AND completed_at IS NULL
                "#,
            )
            .bind(execution_id)
            .bind(&step_id)
            .bind(&envelope)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

            if updated.rows_affected() > 0 {
                sqlx::query("DELETE FROM timers WHERE execution_id = $1 AND step_id = $2")
                    .bind(execution_id)
                    .bind(&step_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::Sqlx)?;
                affected.push(execution_id);
            }
        }

        sqlx::query("DELETE FROM signal_waiters WHERE signal_id = $1")
            .bind(signal_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

        tx.commit().await.map_err(StoreError::Sqlx)?;
        debug!(delivered = affected.len(), "signal delivered");
        Ok(affected)
    }

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<bool, StoreError> {
        let error_json = patch
            .error
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null));

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $3,
                updated_at = now(),
                result = COALESCE($4, result),
                error = COALESCE($5, error),
                completed_at = COALESCE($6, completed_at),
                wake_at = CASE WHEN $7 THEN $8 ELSE wake_at END,
                pending_signal_id = CASE WHEN $9 THEN $10 ELSE pending_signal_id END,
                attempt = attempt + CASE WHEN $11 THEN 1 ELSE 0 END,
                lease_owner = CASE WHEN $12 THEN NULL ELSE lease_owner END,
                lease_id = CASE WHEN $12 THEN NULL ELSE lease_id END,
                lease_expires_at = CASE WHEN $12 THEN NULL ELSE lease_expires_at END
            WHERE id = $1 AND status = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(execution_id)
        .bind(status_to_str(from))
        .bind(status_to_str(to))
        .bind(&patch.result)
        .bind(&error_json)
        .bind(patch.completed_at)
        .bind(patch.wake_at.is_some())
        .bind(patch.wake_at.flatten())
        .bind(patch.pending_signal_id.is_some())
        .bind(patch.pending_signal_id.flatten())
        .bind(patch.increment_attempt)
        .bind(patch.clear_lease)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // (I5) terminal statuses are absorbing. Cancelling an execution
        // that is already terminal is the one sanctioned no-op: report
        // success without touching the row, matching memory.rs.
        if to == ExecutionStatus::Cancelled {
            let already_terminal: Option<(String,)> = sqlx::query_as(
                "SELECT status FROM executions \
                 WHERE id = $1 AND status = $2 \
                 AND status IN ('completed', 'failed', 'cancelled')",
            )
            .bind(execution_id)
            .bind(status_to_str(from))
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;
            return Ok(already_terminal.is_some());
        }

        Ok(false)
    }

    async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'cancelled',
                completed_at = COALESCE(completed_at, now()),
                updated_at = now(),
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_note(&self, note: NoteEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO notes (execution_id, message, recorded_at) VALUES ($1, $2, $3)")
            .bind(note.execution_id)
            .bind(&note.message)
            .bind(note.recorded_at)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn list_notes(&self, execution_id: Uuid) -> Result<Vec<NoteEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT execution_id, message, recorded_at FROM notes WHERE execution_id = $1 ORDER BY recorded_at",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        rows.into_iter()
            .map(|row| {
                Ok(NoteEntry {
                    execution_id: row.try_get("execution_id").map_err(StoreError::Sqlx)?,
                    message: row.try_get("message").map_err(StoreError::Sqlx)?,
                    recorded_at: row.try_get("recorded_at").map_err(StoreError::Sqlx)?,
                })
            })
            .collect()
    }
}
