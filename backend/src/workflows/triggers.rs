// Workflow Triggers - start runs from data events and cron ticks

use chrono::Utc;
use flowcore_shared::{DataEvent, WorkflowTrigger, TRIGGER_MODEL};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conditions::matches_filter;
use super::engine::WorkflowEngine;
use crate::error::{WorkflowError, WorkflowResult};
use crate::jobs::{JobScheduler, LockOutcome};
use crate::services::DataEventReceiver;
use crate::store::WorkflowStore;

#[derive(Clone)]
pub struct TriggerMatcher {
    store: Arc<dyn WorkflowStore>,
    engine: WorkflowEngine,
}

impl TriggerMatcher {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Start a run for every active trigger listening for this event whose
    /// filter accepts the document. A failing trigger does not stop the rest.
    pub async fn on_data_event(&self, event: &DataEvent) -> WorkflowResult<Vec<Uuid>> {
        let triggers = self.store.event_triggers(&event.model, event.kind).await?;
        let mut started = Vec::new();

        for trigger in triggers {
            if !matches_filter(trigger.data_filter.as_ref(), &event.document) {
                debug!("Trigger '{}' filter rejected {} event", trigger.name, event.kind);
                continue;
            }

            let context = json!({ "triggerData": event.document });
            match self
                .engine
                .create_run(trigger.workflow_id, Some(trigger.id), context, event.user.clone())
                .await
            {
                Ok(run) => {
                    info!(
                        "Trigger '{}' matched {} on {}, starting run {}",
                        trigger.name, event.kind, event.model, run.id
                    );
                    self.engine.spawn(run.id);
                    started.push(run.id);
                }
                Err(e) => {
                    error!("Trigger '{}' failed to start its workflow: {}", trigger.name, e);
                }
            }
        }

        Ok(started)
    }

    /// Handle one cron tick under the trigger's job lock. `None` when
    /// another process holds the lock.
    pub async fn fire_cron(&self, trigger: &WorkflowTrigger) -> WorkflowResult<Option<Uuid>> {
        let minutes = trigger
            .lock_duration_minutes
            .unwrap_or(self.engine.config().default_lock_minutes);
        let job_id = trigger.job_id();
        let engine = self.engine.clone();
        let trigger = trigger.clone();

        let outcome = self
            .engine
            .locks()
            .with_lock(&job_id, minutes, || async move {
                let context = json!({
                    "triggerData": {
                        "triggerId": trigger.id,
                        "triggerName": trigger.name,
                        "firedAt": Utc::now(),
                    }
                });
                let run = engine
                    .create_run(trigger.workflow_id, Some(trigger.id), context, None)
                    .await?;
                engine.start_run(run.id).await?;
                Ok::<_, WorkflowError>(run.id)
            })
            .await?;

        match outcome {
            LockOutcome::Acquired(result) => result.map(Some),
            LockOutcome::NotAcquired => Ok(None),
        }
    }
}

/// Feed data events to the matcher until the channel closes. Events on the
/// trigger model also re-sync cron registrations.
pub async fn dispatch_events(
    mut events: DataEventReceiver,
    matcher: TriggerMatcher,
    scheduler: JobScheduler,
) {
    while let Some(event) = events.recv().await {
        if event.model == TRIGGER_MODEL {
            if let Err(e) = scheduler.sync_from_event(&event).await {
                warn!("Failed to sync cron registration: {}", e);
            }
        }

        if let Err(e) = matcher.on_data_event(&event).await {
            error!("Failed to match {} event on {}: {}", event.kind, event.model, e);
        }
    }

    info!("Data event channel closed, dispatcher stopping");
}
