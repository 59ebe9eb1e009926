//! Persistence trait for scheduled tasks and their run history.

use async_trait::async_trait;

use crate::{
    Result,
    types::{ScheduledTask, TaskRunLog, TaskStatus},
};

/// Persistence backend for tasks and run logs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &ScheduledTask) -> Result<()>;
    async fn get_task_by_id(&self, id: &str) -> Result<Option<ScheduledTask>>;
    /// All tasks, or only those owned by `group_folder`, oldest first.
    async fn list_tasks(&self, group_folder: Option<&str>) -> Result<Vec<ScheduledTask>>;
    /// Active tasks whose `next_run` is at or before `now_ms`, earliest first.
    async fn get_due_tasks(&self, now_ms: u64) -> Result<Vec<ScheduledTask>>;
    /// Record a finished run. A `None` next run marks the task done.
    async fn update_task_after_run(
        &self,
        id: &str,
        run_at: u64,
        next_run: Option<u64>,
        last_result: &str,
    ) -> Result<()>;
    async fn log_task_run(&self, entry: &TaskRunLog) -> Result<()>;
    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()>;
    /// The most recent `limit` runs, oldest first.
    async fn get_runs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>>;
    /// Remove a task together with its run history.
    async fn delete_task(&self, id: &str) -> Result<()>;
}
