// Maintenance Jobs - lock cleanup and orphaned run recovery

use chrono::Utc;
use tracing::info;

use crate::error::WorkflowResult;
use crate::store::LockStore;
use crate::workflows::WorkflowEngine;

pub struct MaintenanceJobs;

impl MaintenanceJobs {
    /// Delete lock rows whose TTL has passed
    pub async fn purge_expired_locks(locks: &dyn LockStore) -> WorkflowResult<u64> {
        let purged = locks.purge_expired().await?;
        if purged > 0 {
            info!("Purged {} expired job locks", purged);
        }
        Ok(purged)
    }

    /// Re-drive runs whose process died between steps
    pub async fn recover_stale_runs(engine: &WorkflowEngine) -> WorkflowResult<usize> {
        let recovered = engine.recover_stale_runs(Utc::now()).await?;
        if recovered > 0 {
            info!("Recovered {} orphaned workflow runs", recovered);
        }
        Ok(recovered)
    }
}
