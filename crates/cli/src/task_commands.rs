use std::sync::Arc;

use {
    anyhow::{Context, Result, bail},
    clap::Subcommand,
    warden_config::WardenConfig,
    warden_cron::{ScheduledTask, SqliteStore, TaskStatus, TaskStore},
};

use crate::serve::Warden;

#[derive(Subcommand)]
pub enum TaskAction {
    /// List scheduled tasks.
    List {
        /// Only tasks owned by this group.
        #[arg(long)]
        group: Option<String>,
    },
    /// Stop a task from running until resumed.
    Pause { id: String },
    /// Re-activate a paused task.
    Resume { id: String },
    /// Mark a task done. Its run history is kept.
    Cancel { id: String },
    /// Run a task once now, without changing its schedule.
    Run { id: String },
    /// Delete a task and its run history.
    Delete { id: String },
    /// Show recent runs of a task.
    Runs {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

async fn open_store(config: &WardenConfig) -> Result<Arc<dyn TaskStore>> {
    let data_dir = config.paths.data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    Ok(Arc::new(SqliteStore::new(&config.paths.database_url()).await?))
}

async fn existing(store: &dyn TaskStore, id: &str) -> Result<ScheduledTask> {
    match store.get_task_by_id(id).await? {
        Some(task) => Ok(task),
        None => bail!("task not found: {id}"),
    }
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn print_task(task: &ScheduledTask) {
    let next = task
        .next_run
        .map(format_ms)
        .unwrap_or_else(|| "-".into());
    println!(
        "  {:<36} {:<14} {:<8} {:<9} {:<26} {}",
        task.id,
        task.group_folder,
        task.schedule_type.as_str(),
        task.status.as_str(),
        next,
        task.schedule_value,
    );
}

pub async fn handle_tasks(action: TaskAction, config: &WardenConfig) -> Result<()> {
    match action {
        TaskAction::List { group } => {
            let store = open_store(config).await?;
            let tasks = store.list_tasks(group.as_deref()).await?;
            if tasks.is_empty() {
                println!("No scheduled tasks.");
            }
            for task in &tasks {
                print_task(task);
            }
        },
        TaskAction::Pause { id } => {
            set_status(config, &id, TaskStatus::Paused, "Paused").await?;
        },
        TaskAction::Resume { id } => {
            set_status(config, &id, TaskStatus::Active, "Resumed").await?;
        },
        TaskAction::Cancel { id } => {
            set_status(config, &id, TaskStatus::Done, "Cancelled").await?;
        },
        TaskAction::Delete { id } => {
            let store = open_store(config).await?;
            existing(store.as_ref(), &id).await?;
            store.delete_task(&id).await?;
            println!("Deleted task {id}");
        },
        TaskAction::Runs { id, limit } => {
            let store = open_store(config).await?;
            existing(store.as_ref(), &id).await?;
            let runs = store.get_runs(&id, limit).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in runs {
                let at = format_ms(run.run_at);
                let detail = run.error.or(run.result).unwrap_or_default();
                println!(
                    "  {at:<26} {:<8} {:>7}ms  {detail}",
                    run.status.as_str(),
                    run.duration_ms
                );
            }
        },
        TaskAction::Run { id } => {
            let warden = Warden::build(config.clone()).await?;
            let outcome = warden.scheduler.run_task_now(&id).await;
            warden.manager.kill_all_containers().await;
            let run = outcome?;
            println!("{} in {}ms", run.status, run.duration_ms);
            if let Some(result) = run.result {
                println!("{result}");
            }
            if let Some(error) = run.error {
                eprintln!("error: {error}");
            }
        },
    }
    Ok(())
}

async fn set_status(config: &WardenConfig, id: &str, status: TaskStatus, verb: &str) -> Result<()> {
    let store = open_store(config).await?;
    let task = existing(store.as_ref(), id).await?;
    if task.status == TaskStatus::Done && status != TaskStatus::Done {
        bail!("task {id} is already done");
    }
    store.set_status(id, status).await?;
    println!("{verb} task {id}");
    Ok(())
}
