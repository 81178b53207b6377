// Workflow Engine - run state machine
//
// A run walks the step graph one step at a time. Every step transition is
// persisted before the next one starts, so any process can pick a run up
// again from the database: paused runs through the resume poller, and runs
// abandoned mid-flight through stale-run recovery.
//
// Whoever drives a run holds its `workflowRun_<id>` lock and the run's
// current lease. A write under a stale lease is rejected.

use chrono::{DateTime, Duration, Utc};
use flowcore_shared::{RunStatus, User, WorkflowRun, WorkflowStep};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::merge_patch;
use super::conditions::matches_filter;
use super::executor::WorkflowExecutor;
use crate::error::{WorkflowError, WorkflowResult};
use crate::jobs::lock::{JobLockService, LockOutcome};
use crate::store::WorkflowStore;

/// Runs handled per poller pass
const RESUME_BATCH: i64 = 100;

pub const LOOP_GUARD_ERROR: &str = "loop guard exceeded";

/// Lock key shared by everything that drives a run.
pub fn run_job_id(run_id: Uuid) -> String {
    format!("workflowRun_{}", run_id)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling on executions of one step within one run
    pub max_executions_by_step: u32,
    pub default_lock_minutes: u32,
    /// Pending/running runs untouched for this long are presumed orphaned
    pub stale_run_minutes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_executions_by_step: 20,
            default_lock_minutes: 5,
            stale_run_minutes: 30,
        }
    }
}

/// What the driver should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepProgress {
    /// Moved to the next step, keep going
    Advanced,
    /// Completed, failed, paused or cancelled
    Halted,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<WorkflowExecutor>,
    locks: JobLockService,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: WorkflowExecutor,
        locks: JobLockService,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executor: Arc::new(executor),
            locks,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn locks(&self) -> &JobLockService {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persist a pending run at the workflow's start step. Without an event
    /// user the run acts as the workflow owner.
    pub async fn create_run(
        &self,
        workflow_id: Uuid,
        trigger_id: Option<Uuid>,
        context_data: Value,
        user: Option<User>,
    ) -> WorkflowResult<WorkflowRun> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let run_as = user.or_else(|| workflow.owner.map(User::with_id));
        let run = WorkflowRun::pending(&workflow, trigger_id, context_data, run_as);

        self.store.insert_run(&run).await?;
        info!("Created run {} of workflow '{}'", run.id, workflow.name);
        Ok(run)
    }

    /// Start a pending run on a detached task.
    pub fn spawn(&self, run_id: Uuid) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.start_run(run_id).await {
                error!("Workflow run {} could not be started: {}", run_id, e);
            }
        })
    }

    /// pending -> running, then drive to a halt. `None` when the run was
    /// already claimed or another driver holds its lock.
    pub async fn start_run(&self, run_id: Uuid) -> WorkflowResult<Option<RunStatus>> {
        let outcome = self
            .locks
            .with_lock(&run_job_id(run_id), self.run_lock_minutes(), || {
                self.claim_pending(run_id)
            })
            .await?;

        match outcome {
            LockOutcome::Acquired(result) => result,
            LockOutcome::NotAcquired => {
                debug!("Run {} is locked by another driver", run_id);
                Ok(None)
            }
        }
    }

    async fn claim_pending(&self, run_id: Uuid) -> WorkflowResult<Option<RunStatus>> {
        let lease = Uuid::new_v4();
        if !self.store.start_run(run_id, lease).await? {
            debug!("Run {} was already claimed", run_id);
            return Ok(None);
        }
        self.drive(run_id, lease).await.map(Some)
    }

    /// Execute steps of a running run until it halts. Only the holder of
    /// `lease` may drive. Internal errors fail the run rather than
    /// propagating.
    pub async fn drive(&self, run_id: Uuid, lease: Uuid) -> WorkflowResult<RunStatus> {
        let mut run = self.store.get_run(run_id).await?;
        if run.lease != Some(lease) {
            debug!("Run {} was claimed by another driver", run_id);
            return Ok(run.status);
        }
        if run.status != RunStatus::Running {
            debug!("Run {} is {:?}, not driving it", run_id, run.status);
            return Ok(run.status);
        }

        loop {
            match self.execute_step(&mut run).await {
                Ok(StepProgress::Advanced) => continue,
                Ok(StepProgress::Halted) => return Ok(run.status),
                Err(e) => {
                    error!("Workflow run {} failed: {}", run.id, e);
                    run.status = RunStatus::Failed;
                    run.error = Some(e.to_string());
                    run.resume_at = None;
                    run.completed_at = Some(Utc::now());
                    self.persist(&mut run).await?;
                    return Ok(run.status);
                }
            }
        }
    }

    /// Execute the run's current step and move it along an edge.
    pub async fn execute_step(&self, run: &mut WorkflowRun) -> WorkflowResult<StepProgress> {
        let Some(step_id) = run.current_step else {
            return self.complete(run).await;
        };

        let step = self.store.get_step(step_id).await?;
        if step.workflow_id != run.workflow_id {
            return Err(WorkflowError::NotFound(format!(
                "Step {} in workflow {}",
                step_id, run.workflow_id
            )));
        }

        let executions = run.executions_of(step_id);
        if executions >= self.config.max_executions_by_step {
            warn!(
                "Run {} hit the loop guard on step '{}' after {} executions",
                run.id, step.name, executions
            );
            run.status = RunStatus::Failed;
            run.error = Some(LOOP_GUARD_ERROR.to_string());
            run.completed_at = Some(Utc::now());
            self.persist(run).await?;
            return Ok(StepProgress::Halted);
        }

        run.step_executions_count.insert(step_id, executions + 1);
        if !self.persist(run).await? {
            return Ok(StepProgress::Halted);
        }

        if let Some(conditions) = &step.conditions {
            if !matches_filter(Some(conditions), &run.context_data) {
                info!("Step '{}' conditions not met, skipping its actions", step.name);
                return self.follow_success(run, &step, None).await;
            }
        }

        let actions = self.store.get_actions(&step.actions).await?;
        let mut working = run.context_data.clone();
        let mut pause_until: Option<DateTime<Utc>> = None;

        for action in &actions {
            let outcome = self
                .executor
                .execute(action, &working, run.run_as.as_ref())
                .await;
            debug!(
                "Action '{}' of run {} finished in {}ms",
                action.name, run.id, outcome.duration_ms
            );

            if !outcome.ok {
                let message = outcome.error.unwrap_or_else(|| "action failed".to_string());
                return self.follow_failure(run, &step, &action.name, &message).await;
            }

            merge_patch(&mut working, &outcome.context_patch);
            if let Some(until) = outcome.pause_until {
                pause_until = Some(pause_until.map_or(until, |current| current.max(until)));
            }
        }

        run.context_data = working;
        self.follow_success(run, &step, pause_until).await
    }

    async fn follow_success(
        &self,
        run: &mut WorkflowRun,
        step: &WorkflowStep,
        pause_until: Option<DateTime<Utc>>,
    ) -> WorkflowResult<StepProgress> {
        let Some(next) = step.success_edge() else {
            return self.complete(run).await;
        };

        run.current_step = Some(next);
        if let Some(until) = pause_until {
            run.status = RunStatus::Paused;
            run.resume_at = Some(until);
            self.persist(run).await?;
            info!("Run {} paused until {}", run.id, until);
            return Ok(StepProgress::Halted);
        }

        Ok(if self.persist(run).await? {
            StepProgress::Advanced
        } else {
            StepProgress::Halted
        })
    }

    async fn follow_failure(
        &self,
        run: &mut WorkflowRun,
        step: &WorkflowStep,
        action_name: &str,
        message: &str,
    ) -> WorkflowResult<StepProgress> {
        run.error = Some(format!("{}: {}", action_name, message));

        let Some(next) = step.on_failure_step else {
            error!("Run {} failed at step '{}': {}", run.id, step.name, message);
            run.status = RunStatus::Failed;
            run.completed_at = Some(Utc::now());
            self.persist(run).await?;
            return Ok(StepProgress::Halted);
        };

        warn!(
            "Step '{}' of run {} failed, taking its failure branch: {}",
            step.name, run.id, message
        );
        let mut patch = Map::new();
        patch.insert(
            "error".to_string(),
            json!({ "message": message, "action": action_name, "step": step.id }),
        );
        merge_patch(&mut run.context_data, &patch);
        run.current_step = Some(next);

        Ok(if self.persist(run).await? {
            StepProgress::Advanced
        } else {
            StepProgress::Halted
        })
    }

    async fn complete(&self, run: &mut WorkflowRun) -> WorkflowResult<StepProgress> {
        run.status = RunStatus::Completed;
        run.current_step = None;
        run.resume_at = None;
        run.completed_at = Some(Utc::now());
        if self.persist(run).await? {
            info!("Run {} completed", run.id);
        }
        Ok(StepProgress::Halted)
    }

    /// Write the run back. A rejected write means it was cancelled or that
    /// another driver claimed it; either way this driver stops.
    async fn persist(&self, run: &mut WorkflowRun) -> WorkflowResult<bool> {
        run.updated_at = Utc::now();
        if self.store.save_run(run).await? {
            return Ok(true);
        }

        let current = self.store.get_run(run.id).await?;
        if current.status == RunStatus::Cancelled {
            info!("Run {} was cancelled, stopping", run.id);
        } else {
            warn!("Run {} was claimed by another driver, stopping", run.id);
        }
        run.status = current.status;
        Ok(false)
    }

    fn run_lock_minutes(&self) -> u32 {
        self.config
            .default_lock_minutes
            .max(self.config.stale_run_minutes)
    }

    /// Resume paused runs whose `resume_at` has passed. Returns how many
    /// this process claimed.
    pub async fn resume_due_runs(&self, now: DateTime<Utc>) -> WorkflowResult<usize> {
        let due = self.store.due_paused_runs(now, RESUME_BATCH).await?;
        let mut resumed = 0;

        for run_id in due {
            let engine = self.clone();
            let outcome = self
                .locks
                .with_lock(&run_job_id(run_id), self.run_lock_minutes(), || async move {
                    let lease = Uuid::new_v4();
                    if !engine.store.claim_paused_run(run_id, now, lease).await? {
                        return Ok(false);
                    }
                    engine.drive(run_id, lease).await?;
                    Ok::<_, WorkflowError>(true)
                })
                .await;

            match outcome {
                Ok(LockOutcome::Acquired(Ok(true))) => resumed += 1,
                Ok(LockOutcome::Acquired(Ok(false))) | Ok(LockOutcome::NotAcquired) => {
                    debug!("Run {} is being resumed elsewhere", run_id);
                }
                Ok(LockOutcome::Acquired(Err(e))) | Err(e) => {
                    error!("Failed to resume run {}: {}", run_id, e);
                }
            }
        }

        Ok(resumed)
    }

    /// Pick up pending/running runs nobody has touched for a while.
    pub async fn recover_stale_runs(&self, now: DateTime<Utc>) -> WorkflowResult<usize> {
        let cutoff = now - Duration::minutes(i64::from(self.config.stale_run_minutes));
        let stale = self.store.stale_runs(cutoff, RESUME_BATCH).await?;
        let mut recovered = 0;

        for run_id in stale {
            let engine = self.clone();
            let outcome = self
                .locks
                .with_lock(&run_job_id(run_id), self.run_lock_minutes(), || async move {
                    let lease = Uuid::new_v4();
                    if !engine.store.claim_stale_run(run_id, cutoff, lease).await? {
                        return Ok(false);
                    }
                    warn!("Recovering orphaned run {}", run_id);
                    engine.drive(run_id, lease).await?;
                    Ok::<_, WorkflowError>(true)
                })
                .await;

            match outcome {
                Ok(LockOutcome::Acquired(Ok(true))) => recovered += 1,
                Ok(LockOutcome::Acquired(Ok(false))) | Ok(LockOutcome::NotAcquired) => {}
                Ok(LockOutcome::Acquired(Err(e))) | Err(e) => {
                    error!("Failed to recover run {}: {}", run_id, e);
                }
            }
        }

        Ok(recovered)
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> WorkflowResult<bool> {
        let cancelled = self.store.cancel_run(run_id).await?;
        if cancelled {
            info!("Run {} cancelled", run_id);
        }
        Ok(cancelled)
    }
}
