// Job Lock - at most one holder per job id across processes

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WorkflowResult;
use crate::store::LockStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Acquired(T),
    /// Another holder's lock is live; the work was skipped
    NotAcquired,
}

#[derive(Clone)]
pub struct JobLockService {
    store: Arc<dyn LockStore>,
}

impl JobLockService {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Run `f` while holding the lock on `job_id` for up to `minutes`.
    ///
    /// Never waits for a busy lock. The row is released when `f` returns,
    /// errors or panics; a panic is re-raised after the release.
    pub async fn with_lock<F, Fut, T>(
        &self,
        job_id: &str,
        minutes: u32,
        f: F,
    ) -> WorkflowResult<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let holder = Uuid::new_v4();
        let Some(lock) = self.store.try_acquire(job_id, holder, minutes.max(1)).await? else {
            debug!("Job lock {} is held elsewhere, skipping", job_id);
            return Ok(LockOutcome::NotAcquired);
        };
        debug!("Acquired job lock {} until {}", job_id, lock.locked_until);

        let result = AssertUnwindSafe(async move { f().await }).catch_unwind().await;

        if let Err(e) = self.store.release(job_id, holder).await {
            warn!("Failed to release job lock {}: {}", job_id, e);
        }

        match result {
            Ok(value) => Ok(LockOutcome::Acquired(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
