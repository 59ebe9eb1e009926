//! Process wiring: builds every long-lived service, serves HTTP and tears
//! everything down on shutdown.

use std::sync::{Arc, OnceLock};

use {
    anyhow::Context,
    axum::{
        Json, Router,
        extract::{Path, State},
        response::IntoResponse,
        routing::{get, post},
    },
    tower_http::trace::TraceLayer,
    tracing::{info, warn},
    warden_config::{AssistantConfig, WardenConfig},
    warden_container::{
        ContainerInput, ContainerManager, ContainerRuntime, DockerRuntime, GroupRegistry,
        ManagerConfig,
    },
    warden_cron::{
        ScheduledTask, SchedulerOptions, SqliteStore, TaskRunError, TaskRunFn, TaskRunOutcome,
        TaskScheduler, TaskStore,
    },
    warden_mounts::AllowlistCache,
    warden_sandbox::{SandboxManager, SandboxOptions},
    warden_tools::{HostServices, OutboxSink, SandboxLeases, StoreSnapshots, host_tools},
};

use crate::group_commands::registry_path;

/// Every process-scoped service, created once in `main`.
pub struct Warden {
    pub config: WardenConfig,
    pub groups: Arc<GroupRegistry>,
    pub store: Arc<dyn TaskStore>,
    pub scheduler: Arc<TaskScheduler>,
    pub manager: Arc<ContainerManager>,
    pub sandbox: Arc<SandboxManager>,
    pub leases: Arc<SandboxLeases>,
}

impl Warden {
    pub async fn build(config: WardenConfig) -> anyhow::Result<Self> {
        let data_dir = config.paths.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let groups = Arc::new(GroupRegistry::load(registry_path(&config)).await?);
        let allowlist = Arc::new(AllowlistCache::new(config.mounts.allowlist_path()));
        let store: Arc<dyn TaskStore> =
            Arc::new(SqliteStore::new(&config.paths.database_url()).await?);
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerRuntime::new(config.container.cli.clone()));

        let sandbox = SandboxManager::new(
            Arc::clone(&runtime),
            SandboxOptions::from_config(&config.sandbox),
        );
        let leases = SandboxLeases::new(Arc::clone(&sandbox));

        // The scheduler runs tasks through the manager, and the manager's tool
        // handler needs the scheduler; the cell closes that loop.
        let manager_cell: Arc<OnceLock<Arc<ContainerManager>>> = Arc::new(OnceLock::new());
        let run_fn = scheduled_run_fn(&config, Arc::clone(&groups), Arc::clone(&manager_cell));
        let scheduler = TaskScheduler::new(Arc::clone(&store), run_fn, SchedulerOptions {
            poll_interval: config.scheduler.poll_interval(),
            timezone: config.scheduler.tz()?,
        });

        let tools = host_tools(HostServices {
            scheduler: Arc::clone(&scheduler),
            groups: Arc::clone(&groups),
            allowlist: Arc::clone(&allowlist),
            sink: Arc::new(OutboxSink::new(data_dir.join("outbox.jsonl"))),
            sandbox: config.sandbox.enabled.then(|| Arc::clone(&leases)),
        });
        info!(tools = ?tools.tool_names(), "host tools registered");

        let manager = Arc::new(
            ContainerManager::new(
                runtime,
                ManagerConfig::from_config(&config),
                allowlist,
                Arc::clone(&groups),
            )
            .with_handler(Arc::new(tools))
            .with_snapshots(Arc::new(StoreSnapshots::new(Arc::clone(&store)))),
        );
        let _ = manager_cell.set(Arc::clone(&manager));

        Ok(Self {
            config,
            groups,
            store,
            scheduler,
            manager,
            sandbox,
            leases,
        })
    }

    /// Stop background work and remove every container this process started.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.leases.release_all().await;
        self.manager.kill_all_containers().await;
        self.sandbox.shutdown().await;
        info!("warden stopped");
    }
}

fn scheduled_run_fn(
    config: &WardenConfig,
    groups: Arc<GroupRegistry>,
    manager: Arc<OnceLock<Arc<ContainerManager>>>,
) -> TaskRunFn {
    let assistant = config.assistant.clone();
    Arc::new(move |task: ScheduledTask| {
        Box::pin(run_scheduled(
            task,
            Arc::clone(&groups),
            manager.get().cloned(),
            assistant.clone(),
        ))
    })
}

/// Run a scheduled task in its group's container.
async fn run_scheduled(
    task: ScheduledTask,
    groups: Arc<GroupRegistry>,
    manager: Option<Arc<ContainerManager>>,
    assistant: AssistantConfig,
) -> TaskRunOutcome {
    let manager = manager.ok_or(TaskRunError::Failed("container manager not ready".into()))?;
    let group = match groups.get(&task.group_folder).await {
        Some(group) if group.active => group,
        Some(_) => return Err(format!("group {} is deactivated", task.group_folder).into()),
        None => return Err(format!("group {} is not registered", task.group_folder).into()),
    };

    let mut input = ContainerInput::for_group(&group, task.prompt.clone(), &assistant.name);
    input.chat_jid = task.chat_jid.clone();
    input.is_scheduled_task = true;
    input.enable_thinking = assistant.enable_thinking;
    if input.model.is_none() {
        input.model = assistant.model.clone();
    }
    info!(
        task = %task.id,
        group = %group.folder,
        context_mode = %task.context_mode,
        "running scheduled task"
    );

    // A flag left by an interrupt of some earlier run is not this run's.
    manager.consume_group_interrupted(&group.folder);
    let output = manager.run_agent(&group, input, None).await;
    if output.is_success() {
        return Ok(output.result);
    }
    let error = output
        .error
        .unwrap_or_else(|| "agent run failed".to_string());
    if output.busy {
        return Err(TaskRunError::Busy(error));
    }
    if manager.consume_group_interrupted(&group.folder) {
        info!(task = %task.id, group = %group.folder, "scheduled run was interrupted");
    }
    Err(error.into())
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    manager: Arc<ContainerManager>,
    sandbox: Arc<SandboxManager>,
}

/// `/health`, `/api/containers`, the interrupt endpoint and the sandbox relay routes.
pub fn build_app(manager: Arc<ContainerManager>, sandbox: Arc<SandboxManager>) -> Router {
    let relay = warden_sandbox::router(Arc::clone(&sandbox));
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/containers", get(containers_handler))
        .route("/api/containers/{group}/interrupt", post(interrupt_handler))
        .with_state(AppState { manager, sandbox })
        .merge(relay)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let containers = state.manager.status().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "containers": containers.len(),
        "sandbox": state.sandbox.is_running(),
    }))
}

async fn containers_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.status().await)
}

async fn interrupt_handler(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> impl IntoResponse {
    let reply = state.manager.interrupt_container(&group).await;
    info!(group = %group, interrupted = reply.interrupted, "interrupt requested over http");
    Json(reply)
}

// ── Serve ────────────────────────────────────────────────────────────────────

pub async fn run(config: WardenConfig) -> anyhow::Result<()> {
    let warden = Warden::build(config).await?;

    if !warden.manager.ensure_image().await {
        warn!(
            image = %warden.config.container.image,
            "agent image unavailable, runs will fail until it exists"
        );
    }
    match warden.manager.cleanup_orphan_persistent_containers().await {
        Ok(0) => {},
        Ok(removed) => info!(removed, "removed orphaned containers"),
        Err(e) => warn!(error = %e, "orphan container cleanup failed"),
    }

    let idle_cleanup = warden.manager.start_container_idle_cleanup();
    let sandbox_watcher = warden
        .config
        .sandbox
        .enabled
        .then(|| warden.sandbox.start_idle_watcher());
    let rotation = warden
        .config
        .sandbox
        .enabled
        .then(|| warden.sandbox.start_password_rotation())
        .flatten();
    warden.scheduler.start().await;

    let addr = format!("{}:{}", warden.config.server.bind, warden.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, groups = warden.groups.list().await.len(), "listening");

    let app = build_app(Arc::clone(&warden.manager), Arc::clone(&warden.sandbox));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    warden.shutdown().await;
    for handle in [Some(idle_cleanup), sandbox_watcher, rotation]
        .into_iter()
        .flatten()
    {
        handle.abort();
    }
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown requested");
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, warden_cron::TaskStatus};

    fn config(dir: &std::path::Path) -> WardenConfig {
        let mut config = WardenConfig::default();
        config.paths.data_dir = Some(dir.join("data"));
        config.paths.project_root = Some(dir.to_path_buf());
        config.mounts.allowlist_path = Some(dir.join("allowlist.json"));
        config
    }

    #[tokio::test]
    async fn health_and_sandbox_status_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::build(config(dir.path())).await.unwrap();
        let app = build_app(Arc::clone(&warden.manager), Arc::clone(&warden.sandbox));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["containers"], 0);
        assert_eq!(health["sandbox"], false);

        let sandbox: serde_json::Value = reqwest::get(format!("http://{addr}/api/sandbox"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sandbox["running"], false);

        let relay = reqwest::get(format!("http://{addr}/novnc/vnc.html"))
            .await
            .unwrap();
        assert_eq!(relay.status(), 503);
    }

    #[tokio::test]
    async fn interrupt_route_answers_definitely() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::build(config(dir.path())).await.unwrap();
        let app = build_app(Arc::clone(&warden.manager), Arc::clone(&warden.sandbox));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let reply: serde_json::Value = client
            .post(format!("http://{addr}/api/containers/family/interrupt"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reply["interrupted"], false);
        assert!(reply["message"].as_str().unwrap().contains("family"));
        assert!(!warden.manager.consume_group_interrupted("family"));

        let wrong_method = client
            .get(format!("http://{addr}/api/containers/family/interrupt"))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong_method.status(), 405);
    }

    #[tokio::test]
    async fn task_for_unknown_group_fails_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::build(config(dir.path())).await.unwrap();
        let task = warden
            .scheduler
            .create_task(warden_cron::TaskCreate {
                group_folder: "ghost".into(),
                chat_jid: "ghost@g.us".into(),
                prompt: "say hi".into(),
                schedule_type: warden_cron::ScheduleType::Once,
                schedule_value: "2020-01-01T00:00:00Z".into(),
                context_mode: Default::default(),
            })
            .await
            .unwrap();

        assert_eq!(warden.scheduler.tick().await, 1);
        let task = warden.store.get_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.last_result.unwrap().contains("not registered"));
        let runs = warden.store.get_runs(&task.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].error.as_deref().unwrap().contains("ghost"));
    }
}
