use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::jobs::{JobLockService, LockOutcome, MaintenanceJobs};
use crate::store::LockStore;
use crate::tests::fixtures::MemoryStore;

const JOB: &str = "workflowTrigger_test";

async fn explode() -> u32 {
    panic!("job exploded");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_contenders_execute_once() {
    let store = Arc::new(MemoryStore::default());
    let locks = JobLockService::new(store.clone());
    let executions = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(16));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let locks = locks.clone();
        let executions = executions.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            locks
                .with_lock(JOB, 5, || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                })
                .await
                .unwrap()
        }));
    }

    let mut acquired = 0;
    for handle in handles {
        if handle.await.unwrap() == LockOutcome::Acquired(()) {
            acquired += 1;
        }
    }

    assert_eq!(acquired, 1);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(store.lock(JOB).is_none());
}

#[tokio::test]
async fn test_expired_lock_can_be_taken_over() {
    let store = Arc::new(MemoryStore::default());
    let locks = JobLockService::new(store.clone());

    store.try_acquire(JOB, Uuid::new_v4(), 5).await.unwrap().unwrap();
    let outcome = locks.with_lock(JOB, 5, || async { 1 }).await.unwrap();
    assert_eq!(outcome, LockOutcome::NotAcquired);

    store.expire_lock(JOB);
    let outcome = locks.with_lock(JOB, 5, || async { 2 }).await.unwrap();
    assert_eq!(outcome, LockOutcome::Acquired(2));
}

#[tokio::test]
async fn test_lock_is_released_after_error() {
    let store = Arc::new(MemoryStore::default());
    let locks = JobLockService::new(store.clone());

    let outcome = locks
        .with_lock(JOB, 5, || async {
            Err::<(), _>(WorkflowError::InvalidAction("bad".to_string()))
        })
        .await
        .unwrap();
    assert!(matches!(outcome, LockOutcome::Acquired(Err(_))));
    assert!(store.lock(JOB).is_none());

    let again = locks.with_lock(JOB, 5, || async { "second" }).await.unwrap();
    assert_eq!(again, LockOutcome::Acquired("second"));
}

#[tokio::test]
async fn test_lock_is_released_after_panic() {
    let store = Arc::new(MemoryStore::default());
    let locks = JobLockService::new(store.clone());

    let task = tokio::spawn({
        let locks = locks.clone();
        async move { locks.with_lock(JOB, 5, explode).await }
    });
    let err = task.await.unwrap_err();
    assert!(err.is_panic());

    assert!(store.lock(JOB).is_none());
}

#[tokio::test]
async fn test_release_only_removes_own_lock() {
    let store = MemoryStore::default();
    let owner = Uuid::new_v4();
    store.try_acquire(JOB, owner, 5).await.unwrap().unwrap();

    store.release(JOB, Uuid::new_v4()).await.unwrap();
    assert_eq!(store.lock(JOB).unwrap().holder, owner);

    store.release(JOB, owner).await.unwrap();
    assert!(store.lock(JOB).is_none());
}

#[tokio::test]
async fn test_purge_removes_only_expired_locks() {
    let store = MemoryStore::default();
    store.try_acquire("live", Uuid::new_v4(), 5).await.unwrap().unwrap();
    store.try_acquire("dead", Uuid::new_v4(), 5).await.unwrap().unwrap();
    store.expire_lock("dead");

    assert_eq!(MaintenanceJobs::purge_expired_locks(&store).await.unwrap(), 1);
    assert!(store.lock("live").is_some());
    assert!(store.lock("dead").is_none());
}
