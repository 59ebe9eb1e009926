//! Poll loop that runs due tasks and advances their schedules.

use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    chrono_tz::Tz,
    tokio::{
        sync::{Mutex, Notify, RwLock},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    warden_common::truncate_chars,
};

use crate::{
    Error, Result,
    schedule::{initial_next_run, next_run_after, validate_schedule},
    store::TaskStore,
    types::{ScheduledTask, TaskCreate, TaskRunLog, TaskRunStatus, TaskStatus},
};

/// Longest `last_result` summary kept on a task.
pub const RESULT_SUMMARY_CHARS: usize = 200;
/// Longest result or error text kept in a run log entry.
pub const RUN_LOG_TEXT_CHARS: usize = 2000;

/// Why an execution produced no result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunError {
    /// The group already had a run in flight. Nothing ran, so the task stays
    /// due and is picked up again on a later poll.
    Busy(String),
    Failed(String),
}

impl fmt::Display for TaskRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy(message) | Self::Failed(message) => f.write_str(message),
        }
    }
}

impl From<String> for TaskRunError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for TaskRunError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Outcome of one execution: the agent's reply, or why there is none.
pub type TaskRunOutcome = std::result::Result<Option<String>, TaskRunError>;

/// Executes a task, typically by running the owning group's agent container.
pub type TaskRunFn =
    Arc<dyn Fn(ScheduledTask) -> Pin<Box<dyn Future<Output = TaskRunOutcome> + Send>> + Send + Sync>;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    /// Timezone cron expressions and offset-less timestamps are read in.
    pub timezone: Tz,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            timezone: chrono_tz::UTC,
        }
    }
}

/// Runs due tasks one after another on a fixed poll interval.
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    run_fn: TaskRunFn,
    options: SchedulerOptions,
    running: RwLock<bool>,
    wake_notify: Arc<Notify>,
    loop_handle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, run_fn: TaskRunFn, options: SchedulerOptions) -> Arc<Self> {
        Arc::new(Self {
            store,
            run_fn,
            options,
            running: RwLock::new(false),
            wake_notify: Arc::new(Notify::new()),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn timezone(&self) -> Tz {
        self.options.timezone
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Start the poll loop. Returns `false` if it is already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        {
            let mut running = self.running.write().await;
            if *running {
                debug!("scheduler loop already running");
                return false;
            }
            *running = true;
        }

        let svc = Arc::clone(self);
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            svc.poll_loop(&token).await;
        });
        *self.loop_handle.lock().await = Some((stop, handle));

        info!(
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            timezone = %self.options.timezone,
            "scheduler started"
        );
        true
    }

    /// Stop the poll loop. A task already running is finished and recorded
    /// first; the rest of its batch is left for the next start.
    pub async fn stop(&self) {
        *self.running.write().await = false;

        let current = self.loop_handle.lock().await.take();
        if let Some((stop, handle)) = current {
            stop.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Validate and persist a new task with its first due time.
    pub async fn create_task(&self, create: TaskCreate) -> Result<ScheduledTask> {
        let tz = self.options.timezone;
        validate_schedule(create.schedule_type, &create.schedule_value, tz)?;
        if create.prompt.trim().is_empty() {
            return Err(Error::message("task prompt is empty"));
        }

        let now = now_ms();
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            next_run: initial_next_run(create.schedule_type, &create.schedule_value, now, tz)?,
            group_folder: create.group_folder,
            chat_jid: create.chat_jid,
            prompt: create.prompt,
            schedule_type: create.schedule_type,
            schedule_value: create.schedule_value,
            context_mode: create.context_mode,
            status: TaskStatus::Active,
            last_run: None,
            last_result: None,
            created_at: now,
        };
        self.store.create_task(&task).await?;
        info!(
            id = %task.id,
            group = %task.group_folder,
            schedule_type = %task.schedule_type,
            next_run = ?task.next_run,
            "task created"
        );
        self.wake_notify.notify_one();
        Ok(task)
    }

    /// Pause, resume or cancel (`done`) a task.
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<ScheduledTask> {
        let task = self
            .store
            .get_task_by_id(id)
            .await?
            .ok_or_else(|| Error::task_not_found(id))?;
        self.store.set_status(id, status).await?;
        info!(id, from = %task.status, to = %status, "task status changed");
        self.store
            .get_task_by_id(id)
            .await?
            .ok_or_else(|| Error::task_not_found(id))
    }

    /// Run a task immediately, outside its schedule.
    ///
    /// The run is logged but `next_run` and `status` are left untouched.
    pub async fn run_task_now(&self, id: &str) -> Result<TaskRunLog> {
        let task = self
            .store
            .get_task_by_id(id)
            .await?
            .ok_or_else(|| Error::task_not_found(id))?;
        info!(id, group = %task.group_folder, "running task on demand");
        let run_at = now_ms();
        let outcome = (self.run_fn)(task.clone()).await;
        let (entry, _) = record(&task, run_at, outcome);
        self.store.log_task_run(&entry).await?;
        Ok(entry)
    }

    /// Run everything currently due. Returns how many tasks executed.
    pub async fn tick(&self) -> usize {
        self.run_due(&CancellationToken::new()).await
    }

    /// Like [`tick`](Self::tick), checking `stop` between tasks.
    async fn run_due(&self, stop: &CancellationToken) -> usize {
        let now = now_ms();
        let due = match self.store.get_due_tasks(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to fetch due tasks");
                return 0;
            },
        };
        if !due.is_empty() {
            debug!(count = due.len(), "tasks due");
        }

        let mut executed = 0;
        for candidate in due {
            if stop.is_cancelled() {
                debug!("scheduler stopping, leaving remaining due tasks");
                break;
            }
            // Paused or finished while earlier tasks in this batch ran.
            let task = match self.store.get_task_by_id(&candidate.id).await {
                Ok(Some(task)) if task.status == TaskStatus::Active => task,
                Ok(_) => {
                    debug!(id = %candidate.id, "task no longer active, skipping");
                    continue;
                },
                Err(e) => {
                    warn!(id = %candidate.id, error = %e, "failed to re-fetch task");
                    continue;
                },
            };
            if self.execute(&task).await {
                executed += 1;
            }
        }
        executed
    }

    async fn poll_loop(self: &Arc<Self>, stop: &CancellationToken) {
        while !stop.is_cancelled() {
            self.run_due(stop).await;

            let notify = Arc::clone(&self.wake_notify);
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(self.options.poll_interval) => {},
                () = notify.notified() => {
                    debug!("scheduler woken early");
                },
            }
        }
        debug!("scheduler loop exited");
    }

    /// Run one due task and advance it. Returns `false` when the group was
    /// busy: nothing ran, so no run is logged and the task stays due.
    async fn execute(&self, task: &ScheduledTask) -> bool {
        info!(id = %task.id, group = %task.group_folder, "running scheduled task");
        let run_at = now_ms();
        let outcome = (self.run_fn)(task.clone()).await;
        if let Err(TaskRunError::Busy(reason)) = &outcome {
            info!(id = %task.id, group = %task.group_folder, reason = %reason, "group busy, task stays due");
            return false;
        }
        let (entry, summary) = record(task, run_at, outcome);

        if let Err(e) = self.store.log_task_run(&entry).await {
            error!(id = %task.id, error = %e, "failed to record task run");
        }

        let next_run = match next_run_after(
            task.schedule_type,
            &task.schedule_value,
            entry.run_at,
            self.options.timezone,
        ) {
            Ok(next) => next,
            Err(e) => {
                // Stored schedule no longer parses; stop it from firing again.
                error!(id = %task.id, error = %e, "cannot compute next run");
                None
            },
        };

        if let Err(e) = self
            .store
            .update_task_after_run(&task.id, entry.run_at, next_run, &summary)
            .await
        {
            error!(id = %task.id, error = %e, "failed to update task after run");
        }
        info!(
            id = %task.id,
            status = %entry.status,
            duration_ms = entry.duration_ms,
            next_run = ?next_run,
            "scheduled task finished"
        );
        true
    }
}

/// Build the run log entry and `last_result` summary for a finished run.
fn record(task: &ScheduledTask, run_at: u64, outcome: TaskRunOutcome) -> (TaskRunLog, String) {
    let duration_ms = now_ms().saturating_sub(run_at);
    match outcome {
        Ok(result) => {
            let summary = result
                .as_deref()
                .map(|r| truncate_chars(r, RESULT_SUMMARY_CHARS))
                .unwrap_or_else(|| "Completed".to_string());
            let entry = TaskRunLog {
                task_id: task.id.clone(),
                run_at,
                duration_ms,
                status: TaskRunStatus::Success,
                result: result.map(|r| truncate_chars(&r, RUN_LOG_TEXT_CHARS)),
                error: None,
            };
            (entry, summary)
        },
        Err(err) => {
            let message = err.to_string();
            warn!(id = %task.id, error = %message, "scheduled task failed");
            let summary = truncate_chars(&format!("Error: {message}"), RESULT_SUMMARY_CHARS);
            let entry = TaskRunLog {
                task_id: task.id.clone(),
                run_at,
                duration_ms,
                status: TaskRunStatus::Error,
                result: None,
                error: Some(truncate_chars(&message, RUN_LOG_TEXT_CHARS)),
            };
            (entry, summary)
        },
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            store_memory::InMemoryStore,
            types::{ContextMode, ScheduleType},
        },
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    fn counting_run_fn(counter: Arc<AtomicUsize>, outcome: TaskRunOutcome) -> TaskRunFn {
        Arc::new(move |_task| {
            counter.fetch_add(1, Ordering::SeqCst);
            let outcome = outcome.clone();
            Box::pin(async move { outcome })
        })
    }

    fn make_scheduler(run_fn: TaskRunFn) -> (Arc<TaskScheduler>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = TaskScheduler::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            run_fn,
            SchedulerOptions {
                poll_interval: Duration::from_millis(20),
                timezone: chrono_tz::UTC,
            },
        );
        (scheduler, store)
    }

    async fn insert_due(store: &InMemoryStore, id: &str, kind: ScheduleType, value: &str) {
        store
            .create_task(&ScheduledTask {
                id: id.into(),
                group_folder: "family".into(),
                chat_jid: "family@g.us".into(),
                prompt: "water the plants".into(),
                schedule_type: kind,
                schedule_value: value.into(),
                context_mode: ContextMode::Isolated,
                status: TaskStatus::Active,
                next_run: Some(1),
                last_run: None,
                last_result: None,
                created_at: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn interval_run_advances_from_start_and_stays_active() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (scheduler, store) = make_scheduler(counting_run_fn(counter.clone(), Ok(Some("done".into()))));
        insert_due(&store, "t", ScheduleType::Interval, "60000").await;

        assert_eq!(scheduler.tick().await, 1);

        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        let run_at = task.last_run.unwrap();
        assert_eq!(task.next_run, Some(run_at + 60_000));
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.last_result.as_deref(), Some("done"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_success_is_done_without_next_run() {
        let (scheduler, store) = make_scheduler(counting_run_fn(Arc::default(), Ok(None)));
        insert_due(&store, "t", ScheduleType::Once, "2024-01-01T00:00:00Z").await;

        scheduler.tick().await;

        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.next_run, None);
        assert_eq!(task.last_result.as_deref(), Some("Completed"));
    }

    #[tokio::test]
    async fn failed_once_is_done_and_logged() {
        let (scheduler, store) = make_scheduler(counting_run_fn(Arc::default(), Err("container exploded".into())));
        insert_due(&store, "t", ScheduleType::Once, "2024-01-01T00:00:00Z").await;

        scheduler.tick().await;

        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.last_result.as_deref(), Some("Error: container exploded"));
        let runs = store.get_runs("t", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, TaskRunStatus::Error);
        assert_eq!(runs[0].error.as_deref(), Some("container exploded"));
    }

    #[tokio::test]
    async fn failed_cron_still_advances() {
        let (scheduler, store) = make_scheduler(counting_run_fn(Arc::default(), Err("nope".into())));
        insert_due(&store, "t", ScheduleType::Cron, "*/5 * * * *").await;

        scheduler.tick().await;

        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert!(task.next_run.unwrap() > task.last_run.unwrap());
    }

    #[tokio::test]
    async fn long_results_are_truncated() {
        let long = "x".repeat(5000);
        let (scheduler, store) = make_scheduler(counting_run_fn(Arc::default(), Ok(Some(long))));
        insert_due(&store, "t", ScheduleType::Interval, "1000").await;

        scheduler.tick().await;

        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        assert_eq!(task.last_result.unwrap().chars().count(), RESULT_SUMMARY_CHARS);
        let runs = store.get_runs("t", 1).await.unwrap();
        assert_eq!(runs[0].result.as_ref().unwrap().chars().count(), RUN_LOG_TEXT_CHARS);
    }

    #[tokio::test]
    async fn task_paused_mid_batch_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        insert_due(&store, "a", ScheduleType::Interval, "60000").await;
        insert_due(&store, "b", ScheduleType::Interval, "60000").await;

        let pause_target = Arc::clone(&store);
        let ran = Arc::new(std::sync::Mutex::new(Vec::new()));
        let ran_clone = Arc::clone(&ran);
        let run_fn: TaskRunFn = Arc::new(move |task: ScheduledTask| {
            let store = Arc::clone(&pause_target);
            let ran = Arc::clone(&ran_clone);
            Box::pin(async move {
                ran.lock().unwrap().push(task.id.clone());
                let other = if task.id == "a" { "b" } else { "a" };
                store.set_status(other, TaskStatus::Paused).await.unwrap();
                Ok::<_, TaskRunError>(None)
            })
        });
        let scheduler = TaskScheduler::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            run_fn,
            SchedulerOptions::default(),
        );

        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(ran.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_now_logs_without_touching_schedule() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (scheduler, store) = make_scheduler(counting_run_fn(counter.clone(), Ok(Some("hi".into()))));
        insert_due(&store, "t", ScheduleType::Once, "2024-01-01T00:00:00Z").await;
        store.set_status("t", TaskStatus::Paused).await.unwrap();

        let entry = scheduler.run_task_now("t").await.unwrap();
        assert_eq!(entry.status, TaskRunStatus::Success);

        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.next_run, Some(1));
        assert_eq!(store.get_runs("t", 10).await.unwrap().len(), 1);
        assert!(scheduler.run_task_now("missing").await.is_err());
    }

    #[tokio::test]
    async fn start_twice_is_noop_and_stop_ends_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (scheduler, store) = make_scheduler(counting_run_fn(counter.clone(), Ok(None)));
        insert_due(&store, "t", ScheduleType::Once, "2024-01-01T00:00:00Z").await;

        assert!(scheduler.start().await);
        assert!(!scheduler.start().await);
        assert!(scheduler.is_running().await);

        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
        // Done tasks are never picked up again.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_group_leaves_once_task_due() {
        let counter = Arc::new(AtomicUsize::new(0));
        let busy = Err(TaskRunError::Busy("group family already has a run in flight".into()));
        let (scheduler, store) = make_scheduler(counting_run_fn(counter.clone(), busy));
        insert_due(&store, "t", ScheduleType::Once, "2024-01-01T00:00:00Z").await;

        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let task = store.get_task_by_id("t").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.next_run, Some(1));
        assert_eq!(task.last_run, None);
        assert!(store.get_runs("t", 10).await.unwrap().is_empty());

        // Still due on the next poll.
        scheduler.tick().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_now_records_busy_as_error() {
        let busy = Err(TaskRunError::Busy("busy".into()));
        let (scheduler, store) = make_scheduler(counting_run_fn(Arc::default(), busy));
        insert_due(&store, "t", ScheduleType::Interval, "60000").await;

        let entry = scheduler.run_task_now("t").await.unwrap();
        assert_eq!(entry.status, TaskRunStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn stop_waits_for_the_run_in_progress() {
        let store = Arc::new(InMemoryStore::new());
        insert_due(&store, "a", ScheduleType::Interval, "60000").await;
        insert_due(&store, "b", ScheduleType::Interval, "60000").await;

        let started = Arc::new(Notify::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, ran_tx) = (Arc::clone(&started), Arc::clone(&ran));
        let run_fn: TaskRunFn = Arc::new(move |_task| {
            let started = Arc::clone(&started_tx);
            let ran = Arc::clone(&ran_tx);
            Box::pin(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, TaskRunError>(Some("slow".into()))
            })
        });
        let scheduler = TaskScheduler::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            run_fn,
            SchedulerOptions::default(),
        );

        scheduler.start().await;
        started.notified().await;
        scheduler.stop().await;

        // The first run finished and was recorded; the second never started.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let tasks = store.list_tasks(None).await.unwrap();
        let finished: Vec<_> = tasks.iter().filter(|t| t.last_run.is_some()).collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].last_result.as_deref(), Some("slow"));
        assert!(finished[0].next_run.unwrap() > 1);
        assert_eq!(store.get_runs(&finished[0].id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_task_validates_and_schedules() {
        let (scheduler, _store) = make_scheduler(counting_run_fn(Arc::default(), Ok(None)));
        let create = |kind, value: &str| TaskCreate {
            group_folder: "family".into(),
            chat_jid: "family@g.us".into(),
            prompt: "ping".into(),
            schedule_type: kind,
            schedule_value: value.into(),
            context_mode: ContextMode::Group,
        };

        let task = scheduler
            .create_task(create(ScheduleType::Interval, "60000"))
            .await
            .unwrap();
        assert_eq!(task.next_run, Some(task.created_at + 60_000));
        assert_eq!(task.status, TaskStatus::Active);

        let cron = scheduler
            .create_task(create(ScheduleType::Cron, "0 9 * * *"))
            .await
            .unwrap();
        assert!(cron.next_run.unwrap() > cron.created_at);

        assert!(matches!(
            scheduler.create_task(create(ScheduleType::Interval, "0")).await,
            Err(Error::InvalidSchedule { .. })
        ));
        assert!(scheduler.create_task(create(ScheduleType::Cron, "whenever")).await.is_err());
    }
}
