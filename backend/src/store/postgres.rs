// Postgres-backed workflow and lock store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore_shared::{
    ActionKind, DataEventKind, JobLock, User, Workflow, WorkflowAction, WorkflowRun, WorkflowStep,
    WorkflowTrigger,
};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use super::{LockStore, WorkflowStore};
use crate::error::{WorkflowError, WorkflowResult};

const RUN_COLUMNS: &str = "id, workflow_id, trigger_id, status, context_data, current_step, \
     error, resume_at, step_executions_count, run_as, started_at, completed_at, updated_at, lease";

const TRIGGER_COLUMNS: &str = "id, name, workflow_id, target_model, on_event, is_active, \
     data_filter, cron_expression, lock_duration_minutes";

#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn step_from_row(row: &PgRow) -> WorkflowResult<WorkflowStep> {
    Ok(WorkflowStep {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        name: row.try_get("name")?,
        actions: row.try_get("actions")?,
        conditions: row.try_get("conditions")?,
        on_success_step: row.try_get("on_success_step")?,
        on_failure_step: row.try_get("on_failure_step")?,
        is_terminal: row.try_get("is_terminal")?,
    })
}

fn action_from_row(row: &PgRow) -> WorkflowResult<WorkflowAction> {
    let definition: Value = row.try_get("definition")?;
    let kind: ActionKind = serde_json::from_value(definition)?;
    Ok(WorkflowAction {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind,
    })
}

fn trigger_from_row(row: &PgRow) -> WorkflowResult<WorkflowTrigger> {
    let id: Uuid = row.try_get("id")?;
    let on_event: Option<String> = row.try_get("on_event")?;
    let on_event = match on_event.as_deref().map(str::parse::<DataEventKind>) {
        Some(Ok(kind)) => Some(kind),
        Some(Err(e)) => {
            warn!("Trigger {} has an unusable onEvent: {}", id, e);
            None
        }
        None => None,
    };
    let lock_minutes: Option<i32> = row.try_get("lock_duration_minutes")?;

    Ok(WorkflowTrigger {
        id,
        name: row.try_get("name")?,
        target_model: row.try_get("target_model")?,
        on_event,
        is_active: row.try_get("is_active")?,
        data_filter: row.try_get("data_filter")?,
        workflow_id: row.try_get("workflow_id")?,
        cron_expression: row.try_get("cron_expression")?,
        lock_duration_minutes: lock_minutes.and_then(|m| u32::try_from(m).ok()),
    })
}

fn run_from_row(row: &PgRow) -> WorkflowResult<WorkflowRun> {
    let counts: Value = row.try_get("step_executions_count")?;
    let step_executions_count: HashMap<Uuid, u32> = serde_json::from_value(counts)?;
    let run_as: Option<Value> = row.try_get("run_as")?;
    let run_as: Option<User> = run_as.map(serde_json::from_value).transpose()?;

    Ok(WorkflowRun {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        trigger_id: row.try_get("trigger_id")?,
        status: row.try_get("status")?,
        context_data: row.try_get("context_data")?,
        current_step: row.try_get("current_step")?,
        error: row.try_get("error")?,
        resume_at: row.try_get("resume_at")?,
        step_executions_count,
        run_as,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
        lease: row.try_get("lease")?,
    })
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn get_workflow(&self, id: Uuid) -> WorkflowResult<Workflow> {
        let row = sqlx::query(
            "SELECT id, name, start_step, owner, created_at FROM workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("Workflow {}", id)))?;

        Ok(Workflow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            start_step: row.try_get("start_step")?,
            owner: row.try_get("owner")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn get_step(&self, id: Uuid) -> WorkflowResult<WorkflowStep> {
        let row = sqlx::query(
            "SELECT id, workflow_id, name, actions, conditions, on_success_step, \
             on_failure_step, is_terminal FROM workflow_steps WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("Workflow step {}", id)))?;

        step_from_row(&row)
    }

    async fn get_actions(&self, ids: &[Uuid]) -> WorkflowResult<Vec<WorkflowAction>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT id, name, definition FROM workflow_actions WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let action = action_from_row(row)?;
            by_id.insert(action.id, action);
        }

        ids.iter()
            .map(|id| {
                by_id
                    .get(id)
                    .cloned()
                    .ok_or_else(|| WorkflowError::NotFound(format!("Workflow action {}", id)))
            })
            .collect()
    }

    async fn get_trigger(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTrigger>> {
        let query = format!("SELECT {} FROM workflow_triggers WHERE id = $1", TRIGGER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(trigger_from_row).transpose()
    }

    async fn event_triggers(
        &self,
        model: &str,
        kind: DataEventKind,
    ) -> WorkflowResult<Vec<WorkflowTrigger>> {
        let query = format!(
            "SELECT {} FROM workflow_triggers \
             WHERE is_active AND target_model = $1 AND on_event = $2",
            TRIGGER_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(model)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(trigger_from_row).collect()
    }

    async fn scheduled_triggers(&self) -> WorkflowResult<Vec<WorkflowTrigger>> {
        let query = format!(
            "SELECT {} FROM workflow_triggers \
             WHERE is_active AND cron_expression IS NOT NULL AND cron_expression <> ''",
            TRIGGER_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(trigger_from_row).collect()
    }

    async fn insert_run(&self, run: &WorkflowRun) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, workflow_id, trigger_id, status, context_data, current_step, error,
                resume_at, step_executions_count, run_as, started_at, completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(run.workflow_id)
        .bind(run.trigger_id)
        .bind(run.status)
        .bind(&run.context_data)
        .bind(run.current_step)
        .bind(&run.error)
        .bind(run.resume_at)
        .bind(serde_json::to_value(&run.step_executions_count)?)
        .bind(run.run_as.as_ref().map(serde_json::to_value).transpose()?)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> WorkflowResult<WorkflowRun> {
        let query = format!("SELECT {} FROM workflow_runs WHERE id = $1", RUN_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow run {}", id)))?;

        run_from_row(&row)
    }

    async fn save_run(&self, run: &WorkflowRun) -> WorkflowResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, context_data = $3, current_step = $4, error = $5,
                resume_at = $6, step_executions_count = $7, completed_at = $8,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'cancelled' AND lease IS NOT DISTINCT FROM $9
            "#,
        )
        .bind(run.id)
        .bind(run.status)
        .bind(&run.context_data)
        .bind(run.current_step)
        .bind(&run.error)
        .bind(run.resume_at)
        .bind(serde_json::to_value(&run.step_executions_count)?)
        .bind(run.completed_at)
        .bind(run.lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn start_run(&self, id: Uuid, lease: Uuid) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = 'running', lease = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_paused_run(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Uuid,
    ) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs \
             SET status = 'running', resume_at = NULL, lease = $3, updated_at = NOW() \
             WHERE id = $1 AND status = 'paused' AND resume_at <= $2",
        )
        .bind(id)
        .bind(now)
        .bind(lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_stale_run(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        lease: Uuid,
    ) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = 'running', lease = $3, updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'running') AND updated_at < $2",
        )
        .bind(id)
        .bind(cutoff)
        .bind(lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_run(&self, id: Uuid) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs \
             SET status = 'cancelled', resume_at = NULL, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'running', 'paused')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn due_paused_runs(&self, now: DateTime<Utc>, limit: i64) -> WorkflowResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM workflow_runs WHERE status = 'paused' AND resume_at <= $1 \
             ORDER BY resume_at LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn stale_runs(&self, cutoff: DateTime<Utc>, limit: i64) -> WorkflowResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM workflow_runs WHERE status IN ('pending', 'running') \
             AND updated_at < $1 ORDER BY updated_at LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[async_trait]
impl LockStore for PgWorkflowStore {
    async fn try_acquire(
        &self,
        job_id: &str,
        holder: Uuid,
        ttl_minutes: u32,
    ) -> WorkflowResult<Option<JobLock>> {
        let minutes = i32::try_from(ttl_minutes).unwrap_or(i32::MAX);
        let row = sqlx::query(
            r#"
            INSERT INTO job_locks (job_id, locked_until, holder)
            VALUES ($1, NOW() + make_interval(mins => $2), $3)
            ON CONFLICT (job_id) DO UPDATE
                SET locked_until = EXCLUDED.locked_until, holder = EXCLUDED.holder
                WHERE job_locks.locked_until < NOW()
            RETURNING job_id, locked_until, holder
            "#,
        )
        .bind(job_id)
        .bind(minutes)
        .bind(holder)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> WorkflowResult<JobLock> {
            Ok(JobLock {
                job_id: row.try_get("job_id")?,
                locked_until: row.try_get("locked_until")?,
                holder: row.try_get("holder")?,
            })
        })
        .transpose()
    }

    async fn release(&self, job_id: &str, holder: Uuid) -> WorkflowResult<()> {
        sqlx::query("DELETE FROM job_locks WHERE job_id = $1 AND holder = $2")
            .bind(job_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn purge_expired(&self) -> WorkflowResult<u64> {
        let result = sqlx::query("DELETE FROM job_locks WHERE locked_until < NOW()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
