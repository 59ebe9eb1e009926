//! In-memory store for tests and ephemeral runs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    Error, Result,
    store::TaskStore,
    types::{ScheduledTask, TaskRunLog, TaskStatus},
};

/// Keeps everything in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: Mutex<BTreeMap<String, ScheduledTask>>,
    runs: Mutex<HashMap<String, Vec<TaskRunLog>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn create_task(&self, task: &ScheduledTask) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(&task.id) {
            return Err(Error::message(format!("task already exists: {}", task.id)));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task_by_id(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.get(id).cloned())
    }

    async fn list_tasks(&self, group_folder: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ScheduledTask> = tasks
            .values()
            .filter(|t| group_folder.is_none_or(|g| t.group_folder == g))
            .cloned()
            .collect();
        list.sort_by_key(|t| t.created_at);
        Ok(list)
    }

    async fn get_due_tasks(&self, now_ms: u64) -> Result<Vec<ScheduledTask>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<ScheduledTask> =
            tasks.values().filter(|t| t.is_due(now_ms)).cloned().collect();
        due.sort_by_key(|t| t.next_run);
        Ok(due)
    }

    async fn update_task_after_run(
        &self,
        id: &str,
        run_at: u64,
        next_run: Option<u64>,
        last_result: &str,
    ) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get_mut(id).ok_or_else(|| Error::task_not_found(id))?;
        task.next_run = next_run;
        task.last_run = Some(run_at);
        task.last_result = Some(last_result.to_string());
        if next_run.is_none() {
            task.status = TaskStatus::Done;
        }
        Ok(())
    }

    async fn log_task_run(&self, entry: &TaskRunLog) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.entry(entry.task_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get_mut(id).ok_or_else(|| Error::task_not_found(id))?;
        task.status = status;
        Ok(())
    }

    async fn get_runs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let records = runs.get(task_id).cloned().unwrap_or_default();
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if removed.is_none() {
            return Err(Error::task_not_found(id));
        }
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{ContextMode, ScheduleType, TaskRunStatus},
    };

    fn make_task(id: &str, group: &str, next_run: Option<u64>) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            group_folder: group.into(),
            chat_jid: format!("{group}@g.us"),
            prompt: "check the news".into(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "60000".into(),
            context_mode: ContextMode::Isolated,
            status: TaskStatus::Active,
            next_run,
            last_run: None,
            last_result: None,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn due_tasks_are_active_and_past() {
        let store = InMemoryStore::new();
        store.create_task(&make_task("late", "a", Some(50))).await.unwrap();
        store.create_task(&make_task("early", "a", Some(10))).await.unwrap();
        store.create_task(&make_task("future", "a", Some(500))).await.unwrap();
        store.create_task(&make_task("never", "a", None)).await.unwrap();
        store.create_task(&make_task("paused", "a", Some(5))).await.unwrap();
        store.set_status("paused", TaskStatus::Paused).await.unwrap();

        let due = store.get_due_tasks(100).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["early", "late"]);
    }

    #[tokio::test]
    async fn missing_next_run_marks_done() {
        let store = InMemoryStore::new();
        store.create_task(&make_task("t", "a", Some(1))).await.unwrap();
        store.update_task_after_run("t", 10, None, "ok").await.unwrap();
        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.last_run, Some(10));
        assert_eq!(task.last_result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn list_filters_by_group() {
        let store = InMemoryStore::new();
        store.create_task(&make_task("1", "a", None)).await.unwrap();
        store.create_task(&make_task("2", "b", None)).await.unwrap();
        assert_eq!(store.list_tasks(Some("b")).await.unwrap().len(), 1);
        assert_eq!(store.list_tasks(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn runs_keep_most_recent() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .log_task_run(&TaskRunLog {
                    task_id: "t".into(),
                    run_at: i * 1000,
                    duration_ms: 10,
                    status: TaskRunStatus::Success,
                    result: None,
                    error: None,
                })
                .await
                .unwrap();
        }
        let runs = store.get_runs("t", 3).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].run_at, 2000);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.set_status("nope", TaskStatus::Paused).await,
            Err(Error::TaskNotFound { .. })
        ));
        assert!(store.delete_task("nope").await.is_err());
    }
}
