use flowcore_shared::{RunStatus, WorkflowRun};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use super::fixtures::MemoryStore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("flowcore_server=debug"))
        .try_init();
}

/// Poll the store until the run reaches `status`.
pub async fn wait_for_status(store: &MemoryStore, run_id: Uuid, status: RunStatus) -> WorkflowRun {
    for _ in 0..250 {
        let run = store.run(run_id);
        if run.status == status {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "run {} never reached {:?}, last seen {:?}",
        run_id,
        status,
        store.run(run_id).status
    );
}

/// Poll until `workflow_id` has `count` runs.
pub async fn wait_for_runs(store: &MemoryStore, workflow_id: Uuid, count: usize) -> Vec<WorkflowRun> {
    for _ in 0..250 {
        let runs = store.runs_of(workflow_id);
        if runs.len() >= count {
            return runs;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workflow {} never reached {} runs", workflow_id, count);
}
