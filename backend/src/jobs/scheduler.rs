// Job Scheduler - cron triggers, the resume poller and maintenance

use chrono::Utc;
use flowcore_shared::{DataEvent, DataEventKind, WorkflowTrigger};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::MaintenanceJobs;
use crate::error::WorkflowError;
use crate::store::{LockStore, WorkflowStore};
use crate::workflows::{TriggerMatcher, WorkflowEngine};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Workflow error: {0}")]
    WorkflowError(#[from] WorkflowError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub resume_poll_seconds: u32,
    pub default_lock_minutes: u32,
    pub lock_purge_interval_minutes: u32,
    pub stale_recovery_interval_minutes: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            resume_poll_seconds: 10,
            default_lock_minutes: 5,
            lock_purge_interval_minutes: 15,
            stale_recovery_interval_minutes: 5,
        }
    }
}

/// Accepts 5-field (minute-first), 6-field (seconds-first) and 7-field
/// (with year) cron expressions and returns the seconds-first form.
pub fn normalize_cron(expr: &str) -> Option<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Some(format!("0 {}", fields.join(" "))),
        6 | 7 => Some(fields.join(" ")),
        _ => None,
    }
}

/// Cron expression firing every `seconds`.
fn every_seconds(seconds: u32) -> String {
    match seconds.max(1) {
        s if s < 60 => format!("*/{} * * * * *", s),
        s => format!("0 */{} * * * *", (s / 60).clamp(1, 59)),
    }
}

fn every_minutes(minutes: u32) -> String {
    format!("0 */{} * * * *", minutes.clamp(1, 59))
}

#[derive(Clone)]
pub struct JobScheduler {
    scheduler: TokioScheduler,
    store: Arc<dyn WorkflowStore>,
    locks: Arc<dyn LockStore>,
    matcher: TriggerMatcher,
    engine: WorkflowEngine,
    config: JobConfig,
    /// trigger id -> scheduler job id
    registrations: Arc<RwLock<HashMap<Uuid, Uuid>>>,
}

impl JobScheduler {
    pub async fn new(matcher: TriggerMatcher, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;
        let engine = matcher.engine().clone();

        Ok(Self {
            scheduler,
            store: engine.store().clone(),
            locks: engine.locks().store().clone(),
            matcher,
            engine,
            config,
            registrations: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting workflow job scheduler");

        let triggers = self.store.scheduled_triggers().await?;
        for trigger in &triggers {
            if let Err(e) = self.register(trigger).await {
                warn!("Skipping cron trigger {} ({}): {}", trigger.name, trigger.id, e);
            }
        }

        self.schedule_resume_poller().await?;
        self.schedule_maintenance_jobs().await?;

        self.scheduler.start().await?;

        info!(
            "Workflow job scheduler started with {} cron triggers",
            self.registrations.read().await.len()
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down workflow job scheduler");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    pub async fn is_registered(&self, trigger_id: Uuid) -> bool {
        self.registrations.read().await.contains_key(&trigger_id)
    }

    /// Register (or re-register) the cron job of `trigger`.
    pub async fn register(&self, trigger: &WorkflowTrigger) -> JobResult<()> {
        let expr = trigger
            .cron_expression
            .as_deref()
            .and_then(normalize_cron)
            .ok_or_else(|| {
                JobError::ConfigError(format!(
                    "trigger {} has an invalid cron expression {:?}",
                    trigger.id, trigger.cron_expression
                ))
            })?;

        let scheduler = self.clone();
        let trigger_id = trigger.id;
        let job = Job::new_async(expr.as_str(), move |_uuid, _lock| {
            let scheduler = scheduler.clone();

            Box::pin(async move {
                scheduler.run_tick(trigger_id).await;
            })
        })?;

        let mut registrations = self.registrations.write().await;
        if let Some(previous) = registrations.remove(&trigger.id) {
            self.scheduler.remove(&previous).await?;
        }
        let job_id = self.scheduler.add(job).await?;
        registrations.insert(trigger.id, job_id);

        info!("Scheduled trigger '{}' with cron '{}'", trigger.name, expr);
        Ok(())
    }

    /// Remove the trigger's cron job. Returns false when none was registered.
    pub async fn cancel(&self, trigger_id: Uuid) -> JobResult<bool> {
        let removed = self.registrations.write().await.remove(&trigger_id);
        match removed {
            Some(job_id) => {
                self.scheduler.remove(&job_id).await?;
                info!("Cancelled cron job for trigger {}", trigger_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bring the registration of one trigger in line with its stored state.
    pub async fn sync_trigger(&self, trigger_id: Uuid) -> JobResult<()> {
        match self.store.get_trigger(trigger_id).await? {
            Some(trigger) if trigger.is_active && trigger.is_scheduled() => {
                self.register(&trigger).await
            }
            _ => {
                self.cancel(trigger_id).await?;
                Ok(())
            }
        }
    }

    /// React to a data event on the trigger model.
    pub async fn sync_from_event(&self, event: &DataEvent) -> JobResult<()> {
        let Some(trigger_id) = event.document_id() else {
            warn!("Trigger event without a usable id: {}", event.document);
            return Ok(());
        };

        match event.kind {
            DataEventKind::DataDeleted | DataEventKind::ModelDeleted => {
                self.cancel(trigger_id).await?;
                Ok(())
            }
            _ => self.sync_trigger(trigger_id).await,
        }
    }

    /// One cron tick. The trigger is re-read so that a job whose trigger was
    /// removed or deactivated cancels itself.
    pub async fn run_tick(&self, trigger_id: Uuid) {
        let trigger = match self.store.get_trigger(trigger_id).await {
            Ok(trigger) => trigger,
            Err(e) => {
                error!("Failed to load trigger {}: {}", trigger_id, e);
                return;
            }
        };

        match trigger {
            Some(trigger) if trigger.is_active && trigger.is_scheduled() => {
                match self.matcher.fire_cron(&trigger).await {
                    Ok(Some(run_id)) => info!("Trigger '{}' started run {}", trigger.name, run_id),
                    Ok(None) => debug!("Trigger '{}' tick skipped, lock held", trigger.name),
                    Err(e) => error!("Trigger '{}' tick failed: {}", trigger.name, e),
                }
            }
            _ => {
                info!("Trigger {} is gone or inactive, cancelling its job", trigger_id);
                if let Err(e) = self.cancel(trigger_id).await {
                    warn!("Failed to cancel job for trigger {}: {}", trigger_id, e);
                }
            }
        }
    }

    async fn schedule_resume_poller(&self) -> JobResult<()> {
        let cron_expr = every_seconds(self.config.resume_poll_seconds);
        let engine = self.engine.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                match engine.resume_due_runs(Utc::now()).await {
                    Ok(0) => {}
                    Ok(resumed) => info!("Resumed {} paused workflow runs", resumed),
                    Err(e) => error!("Resume poller failed: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!(
            "Scheduled resume poller to run every {} seconds",
            self.config.resume_poll_seconds
        );

        Ok(())
    }

    async fn schedule_maintenance_jobs(&self) -> JobResult<()> {
        let locks = self.locks.clone();
        let job = Job::new_async(
            every_minutes(self.config.lock_purge_interval_minutes).as_str(),
            move |_uuid, _lock| {
                let locks = locks.clone();

                Box::pin(async move {
                    if let Err(e) = MaintenanceJobs::purge_expired_locks(locks.as_ref()).await {
                        warn!("Job lock cleanup failed: {}", e);
                    }
                })
            },
        )?;
        self.scheduler.add(job).await?;

        let engine = self.engine.clone();
        let job = Job::new_async(
            every_minutes(self.config.stale_recovery_interval_minutes).as_str(),
            move |_uuid, _lock| {
                let engine = engine.clone();

                Box::pin(async move {
                    if let Err(e) = MaintenanceJobs::recover_stale_runs(&engine).await {
                        warn!("Stale run recovery failed: {}", e);
                    }
                })
            },
        )?;
        self.scheduler.add(job).await?;

        Ok(())
    }
}
