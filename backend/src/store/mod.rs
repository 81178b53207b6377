// Persistence seams for workflow definitions, runs and job locks
//
// The engine only talks to these traits. `PgWorkflowStore` backs both in
// production; the test suite uses an in-memory implementation.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore_shared::{
    DataEventKind, JobLock, Workflow, WorkflowAction, WorkflowRun, WorkflowStep, WorkflowTrigger,
};
use uuid::Uuid;

use crate::error::WorkflowResult;

pub use postgres::PgWorkflowStore;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(&self, id: Uuid) -> WorkflowResult<Workflow>;

    async fn get_step(&self, id: Uuid) -> WorkflowResult<WorkflowStep>;

    /// Actions in the order of `ids`. A dangling reference is an error.
    async fn get_actions(&self, ids: &[Uuid]) -> WorkflowResult<Vec<WorkflowAction>>;

    async fn get_trigger(&self, id: Uuid) -> WorkflowResult<Option<WorkflowTrigger>>;

    /// Active triggers listening for `kind` on `model`.
    async fn event_triggers(
        &self,
        model: &str,
        kind: DataEventKind,
    ) -> WorkflowResult<Vec<WorkflowTrigger>>;

    /// Active triggers carrying a cron expression.
    async fn scheduled_triggers(&self) -> WorkflowResult<Vec<WorkflowTrigger>>;

    async fn insert_run(&self, run: &WorkflowRun) -> WorkflowResult<()>;

    async fn get_run(&self, id: Uuid) -> WorkflowResult<WorkflowRun>;

    /// Persist the run unless it was cancelled in the meantime or another
    /// driver has claimed it since (`run.lease` no longer matches).
    /// Returns false when the write was rejected.
    async fn save_run(&self, run: &WorkflowRun) -> WorkflowResult<bool>;

    /// pending -> running, stamping `lease`
    async fn start_run(&self, id: Uuid, lease: Uuid) -> WorkflowResult<bool>;

    /// paused -> running, only once `resume_at` has passed.
    async fn claim_paused_run(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Uuid,
    ) -> WorkflowResult<bool>;

    /// pending/running untouched since `cutoff` -> running. The new lease
    /// locks out whoever was driving it before.
    async fn claim_stale_run(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        lease: Uuid,
    ) -> WorkflowResult<bool>;

    /// Any non-terminal status -> cancelled.
    async fn cancel_run(&self, id: Uuid) -> WorkflowResult<bool>;

    async fn due_paused_runs(&self, now: DateTime<Utc>, limit: i64) -> WorkflowResult<Vec<Uuid>>;

    async fn stale_runs(&self, cutoff: DateTime<Utc>, limit: i64) -> WorkflowResult<Vec<Uuid>>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert the lock row, or take over an expired one. `None` while another
    /// holder's row is still live.
    async fn try_acquire(
        &self,
        job_id: &str,
        holder: Uuid,
        ttl_minutes: u32,
    ) -> WorkflowResult<Option<JobLock>>;

    /// Delete the row if `holder` still owns it.
    async fn release(&self, job_id: &str, holder: Uuid) -> WorkflowResult<()>;

    async fn purge_expired(&self) -> WorkflowResult<u64>;
}
