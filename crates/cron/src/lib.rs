//! Scheduled agent runs: cron, interval and one-shot tasks.
//! Tasks and run history live in SQLite (`<data_dir>/warden.db`).
//! Execution is delegated to a [`scheduler::TaskRunFn`], normally the container manager.

pub mod error;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use {
    error::{Error, Result},
    scheduler::{SchedulerOptions, TaskRunError, TaskRunFn, TaskRunOutcome, TaskScheduler},
    store::TaskStore,
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
    types::{
        ContextMode, ScheduleType, ScheduledTask, TaskCreate, TaskRunLog, TaskRunStatus, TaskStatus,
    },
};

/// Run database migrations for the task tables.
///
/// Creates `scheduled_tasks` and `task_run_logs`. Call at startup before
/// handing a shared pool to [`SqliteStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
