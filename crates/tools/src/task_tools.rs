//! Agent-callable tools for the group's scheduled tasks.

use std::sync::Arc;

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    serde_json::{Value, json},
    tracing::warn,
    warden_common::{IpcContext, ToolOutput},
    warden_container::{GroupRegistry, SnapshotProvider, TaskSnapshot},
    warden_cron::{
        ContextMode, ScheduleType, ScheduledTask, TaskCreate, TaskScheduler, TaskStatus, TaskStore,
    },
};

use crate::registry::{HostTool, json_content, optional_str, require_str};

// ── schedule_task ────────────────────────────────────────────────────────────

pub struct ScheduleTaskTool {
    scheduler: Arc<TaskScheduler>,
    groups: Arc<GroupRegistry>,
}

impl ScheduleTaskTool {
    pub fn new(scheduler: Arc<TaskScheduler>, groups: Arc<GroupRegistry>) -> Self {
        Self { scheduler, groups }
    }

    /// Chat id for tasks created in `folder`; the caller's own chat when it is theirs.
    async fn chat_for(&self, ctx: &IpcContext, folder: &str) -> Result<String> {
        if folder == ctx.group_folder {
            return Ok(ctx.chat_jid.clone());
        }
        match self.groups.get(folder).await {
            Some(group) if group.active => Ok(group.chat_jid),
            Some(_) => bail!("group '{folder}' is deactivated"),
            None => bail!("unknown group '{folder}'"),
        }
    }
}

#[async_trait]
impl HostTool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a prompt to run later in this group's container.\n\
         schedule_type is one of:\n\
         - cron: schedule_value is a cron expression, e.g. \"0 9 * * 1-5\"\n\
         - interval: schedule_value is milliseconds between runs, e.g. \"3600000\"\n\
         - once: schedule_value is a timestamp, e.g. \"2026-03-01T09:00:00\"\n\
         context_mode \"group\" runs with the group's conversation history, \
         \"isolated\" (default) starts fresh."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "What the agent should do when the task fires" },
                "schedule_type": { "type": "string", "enum": ["cron", "interval", "once"] },
                "schedule_value": { "type": "string" },
                "context_mode": { "type": "string", "enum": ["group", "isolated"], "default": "isolated" },
                "target_group": { "type": "string", "description": "Folder of another group (main group only)" }
            },
            "required": ["prompt", "schedule_type", "schedule_value"]
        })
    }

    async fn execute(&self, ctx: &IpcContext, args: Value) -> Result<ToolOutput> {
        let prompt = require_str(&args, "prompt")?;
        let schedule_type: ScheduleType = require_str(&args, "schedule_type")?.parse()?;
        let schedule_value = require_str(&args, "schedule_value")?;
        let context_mode = match optional_str(&args, "context_mode") {
            Some(raw) => raw.parse()?,
            None => ContextMode::default(),
        };
        let folder = optional_str(&args, "target_group").unwrap_or(ctx.group_folder.as_str());
        if !ctx.may_target(folder) {
            return Ok(ToolOutput::error(
                "only the main group can schedule tasks for other groups",
            ));
        }
        let chat_jid = self.chat_for(ctx, folder).await?;

        let task = self
            .scheduler
            .create_task(TaskCreate {
                group_folder: folder.to_string(),
                chat_jid,
                prompt: prompt.to_string(),
                schedule_type,
                schedule_value: schedule_value.to_string(),
                context_mode,
            })
            .await?;
        Ok(ToolOutput::ok(json_content(&json!({
            "id": task.id,
            "groupFolder": task.group_folder,
            "nextRun": task.next_run,
        }))?))
    }
}

// ── list_tasks ───────────────────────────────────────────────────────────────

pub struct ListTasksTool {
    store: Arc<dyn TaskStore>,
}

impl ListTasksTool {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HostTool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List scheduled tasks. Non-main groups only see their own."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, ctx: &IpcContext, _args: Value) -> Result<ToolOutput> {
        let scope = (!ctx.is_main).then_some(ctx.group_folder.as_str());
        let tasks = self.store.list_tasks(scope).await?;
        if tasks.is_empty() {
            return Ok(ToolOutput::ok("No scheduled tasks."));
        }
        let rows: Vec<TaskSnapshot> = tasks.iter().map(snapshot).collect();
        Ok(ToolOutput::ok(json_content(&rows)?))
    }
}

// ── pause_task / resume_task / cancel_task ───────────────────────────────────

/// One of the status-changing task tools; the target status picks which.
pub struct TaskStatusTool {
    scheduler: Arc<TaskScheduler>,
    target: TaskStatus,
}

impl TaskStatusTool {
    pub fn pause(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            scheduler,
            target: TaskStatus::Paused,
        }
    }

    pub fn resume(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            scheduler,
            target: TaskStatus::Active,
        }
    }

    pub fn cancel(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            scheduler,
            target: TaskStatus::Done,
        }
    }
}

#[async_trait]
impl HostTool for TaskStatusTool {
    fn name(&self) -> &str {
        match self.target {
            TaskStatus::Paused => "pause_task",
            TaskStatus::Active => "resume_task",
            TaskStatus::Done => "cancel_task",
        }
    }

    fn description(&self) -> &str {
        match self.target {
            TaskStatus::Paused => "Pause a scheduled task until it is resumed.",
            TaskStatus::Active => "Resume a paused task.",
            TaskStatus::Done => "Cancel a scheduled task. Its run history is kept.",
        }
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "task_id": { "type": "string" } },
            "required": ["task_id"]
        })
    }

    async fn execute(&self, ctx: &IpcContext, args: Value) -> Result<ToolOutput> {
        let id = require_str(&args, "task_id")?;
        let Some(task) = self.scheduler.store().get_task_by_id(id).await? else {
            return Ok(ToolOutput::error(format!("task {id} not found")));
        };
        if !ctx.may_target(&task.group_folder) {
            return Ok(ToolOutput::error(format!(
                "task {id} belongs to another group"
            )));
        }
        if task.status == TaskStatus::Done {
            return Ok(ToolOutput::error(format!("task {id} is already finished")));
        }
        let task = self.scheduler.set_status(id, self.target).await?;
        Ok(ToolOutput::ok(format!("task {} is now {}", task.id, task.status)))
    }
}

// ── Snapshots ────────────────────────────────────────────────────────────────

fn snapshot(task: &ScheduledTask) -> TaskSnapshot {
    TaskSnapshot {
        id: task.id.clone(),
        group_folder: task.group_folder.clone(),
        prompt: task.prompt.clone(),
        schedule_type: task.schedule_type.to_string(),
        schedule_value: task.schedule_value.clone(),
        status: task.status.to_string(),
        next_run: task.next_run,
    }
}

/// Feeds the task list the container manager copies into each IPC directory.
pub struct StoreSnapshots {
    store: Arc<dyn TaskStore>,
}

impl StoreSnapshots {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SnapshotProvider for StoreSnapshots {
    async fn tasks(&self) -> Vec<TaskSnapshot> {
        match self.store.list_tasks(None).await {
            Ok(tasks) => tasks.iter().map(snapshot).collect(),
            Err(e) => {
                warn!(error = %e, "failed to read tasks for snapshot");
                Vec::new()
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        warden_container::Group,
        warden_cron::{InMemoryStore, SchedulerOptions, TaskRunError, TaskRunFn},
    };

    fn ctx(folder: &str, is_main: bool) -> IpcContext {
        IpcContext {
            chat_jid: format!("{folder}@g.us"),
            group_folder: folder.into(),
            is_main,
        }
    }

    async fn setup() -> (Arc<TaskScheduler>, Arc<GroupRegistry>) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryStore::new());
        let run_fn: TaskRunFn = Arc::new(|_| Box::pin(async { Ok::<_, TaskRunError>(None) }));
        let scheduler = TaskScheduler::new(store, run_fn, SchedulerOptions::default());
        let groups = Arc::new(GroupRegistry::in_memory());
        groups
            .register(Group::new("family", "Family", "family@g.us"))
            .await
            .unwrap();
        groups
            .register(Group::new("work", "Work", "work@g.us"))
            .await
            .unwrap();
        (scheduler, groups)
    }

    async fn schedule(
        scheduler: &Arc<TaskScheduler>,
        groups: &Arc<GroupRegistry>,
        ctx: &IpcContext,
        extra: Value,
    ) -> ToolOutput {
        let tool = ScheduleTaskTool::new(Arc::clone(scheduler), Arc::clone(groups));
        let mut args = json!({
            "prompt": "check the calendar",
            "schedule_type": "interval",
            "schedule_value": "60000",
        });
        if let (Some(obj), Value::Object(extra)) = (args.as_object_mut(), extra) {
            obj.extend(extra);
        }
        tool.execute(ctx, args).await.unwrap()
    }

    #[tokio::test]
    async fn schedule_uses_callers_group_and_chat() {
        let (scheduler, groups) = setup().await;
        let out = schedule(&scheduler, &groups, &ctx("family", false), json!({})).await;
        assert!(!out.is_error, "{}", out.content);

        let tasks = scheduler.store().list_tasks(Some("family")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].chat_jid, "family@g.us");
        assert_eq!(tasks[0].context_mode, ContextMode::Isolated);
    }

    #[tokio::test]
    async fn non_main_cannot_schedule_for_others() {
        let (scheduler, groups) = setup().await;
        let out = schedule(
            &scheduler,
            &groups,
            &ctx("family", false),
            json!({"target_group": "work"}),
        )
        .await;
        assert!(out.is_error);
        assert!(scheduler.store().list_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn main_schedules_for_other_group_with_its_chat() {
        let (scheduler, groups) = setup().await;
        let out = schedule(
            &scheduler,
            &groups,
            &ctx("main", true),
            json!({"target_group": "work", "context_mode": "group"}),
        )
        .await;
        assert!(!out.is_error, "{}", out.content);
        let tasks = scheduler.store().list_tasks(Some("work")).await.unwrap();
        assert_eq!(tasks[0].chat_jid, "work@g.us");
        assert_eq!(tasks[0].context_mode, ContextMode::Group);
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected() {
        let (scheduler, groups) = setup().await;
        let tool = ScheduleTaskTool::new(scheduler, groups);
        let result = tool
            .execute(
                &ctx("family", false),
                json!({"prompt": "x", "schedule_type": "interval", "schedule_value": "soon"}),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_is_scoped_for_non_main() {
        let (scheduler, groups) = setup().await;
        schedule(&scheduler, &groups, &ctx("family", false), json!({})).await;
        schedule(&scheduler, &groups, &ctx("work", false), json!({})).await;

        let tool = ListTasksTool::new(Arc::clone(scheduler.store()));
        let own = tool.execute(&ctx("family", false), json!({})).await.unwrap();
        let rows: Vec<TaskSnapshot> = serde_json::from_str(&own.content).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_folder, "family");

        let all = tool.execute(&ctx("main", true), json!({})).await.unwrap();
        let rows: Vec<TaskSnapshot> = serde_json::from_str(&all.content).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn status_tools_respect_ownership() {
        let (scheduler, groups) = setup().await;
        schedule(&scheduler, &groups, &ctx("work", false), json!({})).await;
        let id = scheduler.store().list_tasks(None).await.unwrap()[0].id.clone();

        let pause = TaskStatusTool::pause(Arc::clone(&scheduler));
        let denied = pause
            .execute(&ctx("family", false), json!({"task_id": id}))
            .await
            .unwrap();
        assert!(denied.is_error);

        let ok = pause
            .execute(&ctx("work", false), json!({"task_id": id}))
            .await
            .unwrap();
        assert!(!ok.is_error);
        let task = scheduler.store().get_task_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);

        let resume = TaskStatusTool::resume(Arc::clone(&scheduler));
        resume
            .execute(&ctx("main", true), json!({"task_id": id}))
            .await
            .unwrap();
        let cancel = TaskStatusTool::cancel(Arc::clone(&scheduler));
        cancel
            .execute(&ctx("work", false), json!({"task_id": id}))
            .await
            .unwrap();
        let task = scheduler.store().get_task_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        let again = resume
            .execute(&ctx("work", false), json!({"task_id": id}))
            .await
            .unwrap();
        assert!(again.is_error);
    }

    #[tokio::test]
    async fn unknown_task_is_an_error_result() {
        let (scheduler, _) = setup().await;
        let out = TaskStatusTool::cancel(scheduler)
            .execute(&ctx("main", true), json!({"task_id": "missing"}))
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn snapshots_cover_every_group() {
        let (scheduler, groups) = setup().await;
        schedule(&scheduler, &groups, &ctx("family", false), json!({})).await;
        schedule(&scheduler, &groups, &ctx("work", false), json!({})).await;
        let snapshots = StoreSnapshots::new(Arc::clone(scheduler.store()));
        let rows = snapshots.tasks().await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == "active" && r.schedule_type == "interval"));
    }
}
