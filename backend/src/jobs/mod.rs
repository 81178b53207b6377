// Background Jobs
//
// Cron triggers, the paused-run poller and housekeeping, all scheduled with
// tokio-cron-scheduler. Work that must run once across processes goes
// through the job lock.

pub mod lock;
pub mod maintenance;
pub mod scheduler;

pub use lock::{JobLockService, LockOutcome};
pub use maintenance::MaintenanceJobs;
pub use scheduler::{JobConfig, JobError, JobResult, JobScheduler};
