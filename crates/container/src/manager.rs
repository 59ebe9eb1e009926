//! Agent container lifecycle.
//!
//! One slot per group folder. A slot holds at most one live container and a
//! `busy` flag; a second `run_agent` for a group that is already running is
//! rejected immediately rather than queued. Persistent containers are reused
//! across runs until they go idle, are interrupted, or die. One-shot and
//! scheduled runs always get a fresh container that is removed afterwards.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    serde_json::json,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
        process::Child,
        sync::{Mutex, RwLock, mpsc},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
    warden_common::{ContainerMode, IpcContext},
    warden_config::WardenConfig,
    warden_mounts::AllowlistCache,
    warden_protocol::{AgentRunParams, AgentRunResult, Event, methods},
};

use crate::{
    Error, Result,
    group::{GLOBAL_FOLDER, Group, GroupRegistry},
    now_ms,
    rpc::{RequestHandler, RpcChannel},
    runtime::{BindMount, ContainerRuntime, LABEL_GROUP, LABEL_MANAGED, LABEL_MODE, RunSpec},
    types::{
        AgentCallbacks, AgentEvent, ContainerInput, ContainerOutput, GroupSnapshot, HandleStatus,
        InterruptResult, SnapshotProvider,
    },
};

/// How long a shutdown notice may take before the container is killed anyway.
const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

pub const TASKS_SNAPSHOT_FILE: &str = "current_tasks.json";
pub const GROUPS_SNAPSHOT_FILE: &str = "available_groups.json";

/// Settings the manager needs, flattened out of [`WardenConfig`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub image: String,
    pub build_context: Option<PathBuf>,
    pub run_timeout: Duration,
    pub startup_timeout: Duration,
    pub idle_timeout: Duration,
    pub idle_poll_interval: Duration,
    pub interrupt_grace: Duration,
    pub max_log_bytes: usize,
    pub memory_limit: Option<String>,
    pub cpu_quota: Option<f64>,
    pub no_network: bool,
    pub timezone: Option<String>,
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl ManagerConfig {
    pub fn from_config(cfg: &WardenConfig) -> Self {
        let c = &cfg.container;
        Self {
            image: c.image.clone(),
            build_context: c.build_context.clone(),
            run_timeout: c.run_timeout(),
            startup_timeout: c.startup_timeout(),
            idle_timeout: c.idle_timeout(),
            idle_poll_interval: c.idle_poll_interval(),
            interrupt_grace: c.interrupt_grace(),
            max_log_bytes: c.max_log_bytes,
            memory_limit: c.memory_limit.clone(),
            cpu_quota: c.cpu_quota,
            no_network: c.no_network,
            timezone: cfg.scheduler.timezone.clone(),
            project_root: cfg.paths.project_root(),
            groups_dir: cfg.paths.groups_dir(),
            data_dir: cfg.paths.data_dir(),
        }
    }

    fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(folder)
    }
}

struct ContainerHandle {
    name: String,
    mode: ContainerMode,
    created_at: u64,
    last_activity: Arc<AtomicU64>,
    interrupted: AtomicBool,
    /// Additional mounts the container was created with.
    extra_mounts: Vec<BindMount>,
    channel: Arc<RpcChannel>,
    sink: Arc<std::sync::Mutex<Option<Arc<dyn AgentCallbacks>>>>,
    child: Mutex<Option<Child>>,
}

impl ContainerHandle {
    fn is_reusable(&self, extra_mounts: &[BindMount]) -> bool {
        self.mode == ContainerMode::Persistent
            && !self.channel.is_closed()
            && !self.interrupted.load(Ordering::SeqCst)
            && self.extra_mounts == extra_mounts
    }

    fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::SeqCst);
    }

    fn set_sink(&self, sink: Option<Arc<dyn AgentCallbacks>>) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = sink;
    }
}

#[derive(Default)]
struct GroupSlot {
    busy: AtomicBool,
    handle: Mutex<Option<Arc<ContainerHandle>>>,
    /// Cancels the in-flight `agent.run`, if any.
    run: std::sync::Mutex<Option<CancellationToken>>,
}

impl GroupSlot {
    fn take_run_token(&self) -> Option<CancellationToken> {
        self.run.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn set_run_token(&self, token: Option<CancellationToken>) {
        *self.run.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }
}

/// Clears the slot's busy flag when the run ends, however it ends.
struct BusyGuard<'a>(&'a GroupSlot);

impl<'a> BusyGuard<'a> {
    fn acquire(slot: &'a GroupSlot) -> Option<Self> {
        slot.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(slot))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: ManagerConfig,
    allowlist: Arc<AllowlistCache>,
    groups: Arc<GroupRegistry>,
    handler: Option<Arc<dyn RequestHandler>>,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    slots: RwLock<HashMap<String, Arc<GroupSlot>>>,
    interrupted: std::sync::Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: ManagerConfig,
        allowlist: Arc<AllowlistCache>,
        groups: Arc<GroupRegistry>,
    ) -> Self {
        Self {
            runtime,
            config,
            allowlist,
            groups,
            handler: None,
            snapshots: None,
            slots: RwLock::new(HashMap::new()),
            interrupted: std::sync::Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Handler for `tool.call` requests arriving from containers.
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    async fn slot(&self, folder: &str) -> Arc<GroupSlot> {
        if let Some(slot) = self.slots.read().await.get(folder) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(folder.to_string()).or_default())
    }

    async fn all_slots(&self) -> Vec<(String, Arc<GroupSlot>)> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    // ── Image ────────────────────────────────────────────────────────────────

    /// Make sure the agent image exists, building it when a build context is
    /// configured. Never fails; returns whether the image is usable.
    pub async fn ensure_image(&self) -> bool {
        let image = &self.config.image;
        match self.runtime.image_exists(image).await {
            Ok(true) => {
                debug!(image, "agent image present");
                return true;
            },
            Ok(false) => {},
            Err(e) => {
                warn!(image, error = %e, "could not inspect agent image");
                return false;
            },
        }

        let Some(context) = &self.config.build_context else {
            warn!(image, "agent image missing and no build context configured");
            return false;
        };
        match self.runtime.build_image(image, context).await {
            Ok(()) => {
                info!(image, "agent image built");
                true
            },
            Err(e) => {
                warn!(image, error = %e, "agent image build failed");
                false
            },
        }
    }

    // ── Runs ─────────────────────────────────────────────────────────────────

    /// Run one agent turn for `group`.
    ///
    /// Never returns `Err`: every failure, including a busy group, a rejected
    /// mount or a runtime fault, is reported as an error output.
    pub async fn run_agent(
        &self,
        group: &Group,
        input: ContainerInput,
        callbacks: Option<Arc<dyn AgentCallbacks>>,
    ) -> ContainerOutput {
        let slot = self.slot(&group.folder).await;
        let Some(_busy) = BusyGuard::acquire(&slot) else {
            info!(group = %group.folder, "rejecting run, group busy");
            return ContainerOutput::busy(
                Error::Busy {
                    group: group.folder.clone(),
                }
                .to_string(),
            );
        };

        let started = now_ms();
        match self.run_in_slot(&slot, group, input, callbacks).await {
            Ok(output) => {
                info!(
                    group = %group.folder,
                    status = ?output.status,
                    elapsed_ms = now_ms().saturating_sub(started),
                    "agent run finished"
                );
                output
            },
            Err(e) => {
                warn!(group = %group.folder, error = %e, "agent run failed");
                ContainerOutput::error(e.to_string())
            },
        }
    }

    async fn run_in_slot(
        &self,
        slot: &GroupSlot,
        group: &Group,
        input: ContainerInput,
        callbacks: Option<Arc<dyn AgentCallbacks>>,
    ) -> Result<ContainerOutput> {
        if self.shutdown.is_cancelled() {
            return Err(Error::message("container manager is shutting down"));
        }

        let extra_mounts = self.validated_mounts(group, &input)?;
        self.write_snapshots(&group.folder, group.is_main).await;

        let one_shot = input.is_scheduled_task || group.container_mode == ContainerMode::OneShot;
        let handle = self.acquire_handle(slot, group, extra_mounts, one_shot).await?;

        let params = serde_json::to_value(AgentRunParams {
            prompt: input.prompt,
            group_folder: group.folder.clone(),
            chat_jid: input.chat_jid,
            is_main: group.is_main,
            is_scheduled_task: input.is_scheduled_task,
            assistant_name: input.assistant_name,
            provider: input.provider.to_string(),
            model: input.model,
            enable_thinking: input.enable_thinking,
        })?;
        let timeout = group
            .timeout_ms
            .map_or(self.config.run_timeout, Duration::from_millis);

        let token = CancellationToken::new();
        slot.set_run_token(Some(token.clone()));
        handle.set_sink(callbacks);
        handle.touch();

        let outcome = handle
            .channel
            .request_with_cancel(methods::AGENT_RUN, params, timeout, &token)
            .await;

        // The sink stays until the next run so trailing events still reach it.
        slot.set_run_token(None);
        handle.touch();

        let output = match outcome {
            Ok(value) => match serde_json::from_value::<AgentRunResult>(value) {
                Ok(result) => ContainerOutput::from(result),
                Err(e) => ContainerOutput::error(format!("invalid agent.run result: {e}")),
            },
            Err(Error::Interrupted) => {
                info!(group = %group.folder, container = %handle.name, "agent run interrupted");
                ContainerOutput::error(Error::Interrupted.to_string())
            },
            Err(e @ Error::Timeout { .. }) => {
                warn!(group = %group.folder, container = %handle.name, "agent run timed out, removing container");
                self.discard(slot, &handle).await;
                return Ok(ContainerOutput::error(e.to_string()));
            },
            Err(e) => {
                if handle.channel.is_closed() {
                    self.discard(slot, &handle).await;
                    return Ok(ContainerOutput::error(e.to_string()));
                }
                ContainerOutput::error(e.to_string())
            },
        };

        if handle.mode == ContainerMode::OneShot {
            self.discard(slot, &handle).await;
        }
        Ok(output)
    }

    /// Validate group and per-run mounts. Any rejection aborts the run.
    fn validated_mounts(&self, group: &Group, input: &ContainerInput) -> Result<Vec<BindMount>> {
        let specs: Vec<_> = group
            .additional_mounts
            .iter()
            .chain(input.mounts.iter())
            .collect();
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        specs
            .into_iter()
            .map(|spec| {
                let decision = self.allowlist.validate(spec, group.is_main);
                match decision.effective {
                    Some(m) => Ok(BindMount {
                        host_path: m.host_path,
                        container_path: m.container_path,
                        read_only: m.read_only,
                    }),
                    None => {
                        warn!(group = %group.folder, host = %spec.host_path, reason = %decision.reason, "mount rejected");
                        Err(Error::MountRejected {
                            reason: format!("{}: {}", spec.host_path, decision.reason),
                        })
                    },
                }
            })
            .collect()
    }

    async fn acquire_handle(
        &self,
        slot: &GroupSlot,
        group: &Group,
        extra_mounts: Vec<BindMount>,
        one_shot: bool,
    ) -> Result<Arc<ContainerHandle>> {
        let mut current = slot.handle.lock().await;

        if !one_shot
            && let Some(existing) = current.as_ref()
            && existing.is_reusable(&extra_mounts)
        {
            debug!(group = %group.folder, container = %existing.name, "reusing persistent container");
            return Ok(Arc::clone(existing));
        }

        // Keep at most one container per group.
        if let Some(stale) = current.take() {
            debug!(group = %group.folder, container = %stale.name, "replacing container");
            destroy_handle(self.runtime.as_ref(), &stale).await;
        }

        let mode = if one_shot {
            ContainerMode::OneShot
        } else {
            ContainerMode::Persistent
        };
        let handle = Arc::new(self.start_container(group, mode, extra_mounts).await?);
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    async fn discard(&self, slot: &GroupSlot, handle: &Arc<ContainerHandle>) {
        detach_and_destroy(self.runtime.as_ref(), slot, handle).await;
    }

    async fn start_container(
        &self,
        group: &Group,
        mode: ContainerMode,
        extra_mounts: Vec<BindMount>,
    ) -> Result<ContainerHandle> {
        let folder = &group.folder;
        let group_dir = self.config.groups_dir.join(folder);
        let ipc_dir = self.config.ipc_dir(folder);
        let log_dir = group_dir.join("logs");
        for dir in [&group_dir, &ipc_dir, &log_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut mounts = self.default_mounts(group, &group_dir, &ipc_dir).await;
        mounts.extend(extra_mounts.iter().cloned());

        let created_at = now_ms();
        let name = container_name(folder, created_at);
        let mut env = vec![("WARDEN_GROUP".to_string(), folder.clone())];
        if let Some(tz) = &self.config.timezone {
            env.push(("TZ".to_string(), tz.clone()));
        }
        let spec = RunSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            labels: vec![
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_GROUP.to_string(), folder.clone()),
                (LABEL_MODE.to_string(), mode.as_str().to_string()),
            ],
            mounts,
            env,
            ports: Vec::new(),
            memory_limit: self.config.memory_limit.clone(),
            cpu_quota: self.config.cpu_quota,
            no_network: self.config.no_network,
            command: Vec::new(),
        };

        info!(
            group = %folder,
            container = %name,
            mode = %mode,
            backend = self.runtime.name(),
            mounts = spec.mounts.len(),
            "starting agent container"
        );
        let spawned = self.runtime.spawn(&spec).await?;

        if let Some(stderr) = spawned.stderr {
            let log_path = log_dir.join(format!(
                "container-{}.log",
                chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
            ));
            tokio::spawn(capture_log(
                stderr,
                log_path,
                self.config.max_log_bytes,
                name.clone(),
            ));
        }

        let ctx = IpcContext {
            chat_jid: group.chat_jid.clone(),
            group_folder: folder.clone(),
            is_main: group.is_main,
        };
        let (channel, mut events) =
            RpcChannel::spawn(spawned.stdout, spawned.stdin, ctx, self.handler.clone());

        let ready = tokio::time::timeout(self.config.startup_timeout, async {
            while let Some(event) = events.recv().await {
                if event.method == methods::AGENT_READY {
                    return true;
                }
                trace!(method = %event.method, "event before ready ignored");
            }
            false
        })
        .await;

        let failure = match ready {
            Ok(true) => None,
            Ok(false) => Some(Error::runtime(format!(
                "container {name} exited before becoming ready"
            ))),
            Err(_) => Some(Error::timeout("container startup", self.config.startup_timeout)),
        };
        if let Some(err) = failure {
            warn!(group = %folder, container = %name, error = %err, "agent container failed to start");
            channel.close().await;
            if let Err(e) = self.runtime.kill(&name).await {
                debug!(container = %name, error = %e, "cleanup after failed start");
            }
            if let Some(mut child) = spawned.child {
                let _ = child.kill().await;
            }
            return Err(err);
        }

        let last_activity = Arc::new(AtomicU64::new(created_at));
        let sink: Arc<std::sync::Mutex<Option<Arc<dyn AgentCallbacks>>>> =
            Arc::new(std::sync::Mutex::new(None));
        tokio::spawn(pump_events(
            events,
            Arc::clone(&sink),
            Arc::clone(&last_activity),
            folder.clone(),
        ));

        info!(group = %folder, container = %name, "agent container ready");
        Ok(ContainerHandle {
            name,
            mode,
            created_at,
            last_activity,
            interrupted: AtomicBool::new(false),
            extra_mounts,
            channel,
            sink,
            child: Mutex::new(spawned.child),
        })
    }

    async fn default_mounts(&self, group: &Group, group_dir: &Path, ipc_dir: &Path) -> Vec<BindMount> {
        let mut mounts = Vec::new();
        if group.is_main {
            mounts.push(BindMount {
                host_path: self.config.project_root.clone(),
                container_path: "/workspace/project".into(),
                read_only: false,
            });
        }
        mounts.push(BindMount {
            host_path: group_dir.to_path_buf(),
            container_path: "/workspace/group".into(),
            read_only: false,
        });
        if !group.is_main {
            let global = self.config.groups_dir.join(GLOBAL_FOLDER);
            if tokio::fs::try_exists(&global).await.unwrap_or(false) {
                mounts.push(BindMount {
                    host_path: global,
                    container_path: "/workspace/global".into(),
                    read_only: true,
                });
            }
        }
        mounts.push(BindMount {
            host_path: ipc_dir.to_path_buf(),
            container_path: "/workspace/ipc".into(),
            read_only: false,
        });
        mounts
    }

    /// Write `current_tasks.json` and `available_groups.json` into the group's
    /// IPC directory. Non-main groups see only their own tasks and no groups.
    async fn write_snapshots(&self, folder: &str, is_main: bool) {
        let ipc_dir = self.config.ipc_dir(folder);
        if let Err(e) = tokio::fs::create_dir_all(&ipc_dir).await {
            warn!(group = folder, error = %e, "cannot create IPC directory");
            return;
        }

        let tasks = match &self.snapshots {
            Some(provider) => provider.tasks().await,
            None => Vec::new(),
        };
        let visible: Vec<_> = tasks
            .into_iter()
            .filter(|t| is_main || t.group_folder == folder)
            .collect();

        let groups: Vec<GroupSnapshot> = if is_main {
            self.groups.list().await.iter().map(GroupSnapshot::from).collect()
        } else {
            Vec::new()
        };

        let writes = [
            (TASKS_SNAPSHOT_FILE, serde_json::to_string_pretty(&visible)),
            (
                GROUPS_SNAPSHOT_FILE,
                serde_json::to_string_pretty(&json!({
                    "groups": groups,
                    "lastSync": now_ms(),
                })),
            ),
        ];
        for (file, body) in writes {
            let result = match body {
                Ok(body) => tokio::fs::write(ipc_dir.join(file), body)
                    .await
                    .map_err(Error::from),
                Err(e) => Err(Error::from(e)),
            };
            if let Err(e) = result {
                warn!(group = folder, file, error = %e, "failed to write snapshot");
            }
        }
    }

    // ── Interrupts ───────────────────────────────────────────────────────────

    /// Ask the group's agent to stop. The in-flight run resolves immediately
    /// with an error; the container is killed after the grace period.
    pub async fn interrupt_container(&self, folder: &str) -> InterruptResult {
        let slot = self.slots.read().await.get(folder).cloned();
        let handle = match &slot {
            Some(slot) => slot.handle.lock().await.clone(),
            None => None,
        };
        let (Some(slot), Some(handle)) = (slot, handle) else {
            return InterruptResult {
                interrupted: false,
                message: format!("no container running for group {folder}"),
            };
        };

        handle.interrupted.store(true, Ordering::SeqCst);
        self.interrupted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(folder.to_string());

        let cancelled = match slot.take_run_token() {
            Some(token) => {
                token.cancel();
                true
            },
            None => false,
        };

        // Escalation is armed before the notice so a container that no longer
        // reads stdin is still killed after the grace period.
        let grace = self.config.interrupt_grace;
        let runtime = Arc::clone(&self.runtime);
        let escalate = Arc::clone(&handle);
        tokio::spawn(async move {
            tokio::select! {
                () = escalate.channel.closed() => {},
                () = tokio::time::sleep(grace) => {
                    info!(container = %escalate.name, "interrupt grace elapsed, killing container");
                },
            }
            detach_and_destroy(runtime.as_ref(), &slot, &escalate).await;
        });

        let notice = handle.channel.notify(methods::AGENT_INTERRUPT, json!({}));
        match tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT.min(grace), notice).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => debug!(group = folder, error = %e, "interrupt notice not delivered"),
            Err(_) => warn!(group = folder, container = %handle.name, "interrupt notice timed out"),
        }

        info!(group = folder, container = %handle.name, cancelled, "container interrupted");
        InterruptResult {
            interrupted: true,
            message: if cancelled {
                format!(
                    "interrupted running agent; container stops within {}s",
                    grace.as_secs()
                )
            } else {
                "interrupt sent to idle container".to_string()
            },
        }
    }

    /// Whether the group was interrupted since the last call. Clears the flag.
    pub fn consume_group_interrupted(&self, folder: &str) -> bool {
        self.interrupted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(folder)
    }

    // ── Reclamation ──────────────────────────────────────────────────────────

    /// Destroy persistent containers idle past the threshold, and any whose
    /// channel has died. Busy groups are skipped. Returns how many were removed.
    pub async fn reap_idle(&self) -> usize {
        let idle_limit = u64::try_from(self.config.idle_timeout.as_millis()).unwrap_or(u64::MAX);
        let now = now_ms();
        let mut reaped = 0;

        for (folder, slot) in self.all_slots().await {
            if slot.busy.load(Ordering::SeqCst) {
                continue;
            }
            let Ok(mut current) = slot.handle.try_lock() else {
                continue;
            };
            let expired = current.as_ref().is_some_and(|h| {
                h.channel.is_closed()
                    || (h.mode == ContainerMode::Persistent
                        && now.saturating_sub(h.last_activity.load(Ordering::SeqCst)) >= idle_limit)
            });
            if !expired {
                continue;
            }
            if let Some(handle) = current.take() {
                drop(current);
                info!(group = %folder, container = %handle.name, "reclaiming idle container");
                destroy_handle(self.runtime.as_ref(), &handle).await;
                reaped += 1;
            }
        }
        reaped
    }

    /// Background loop calling [`reap_idle`](Self::reap_idle) on the poll interval.
    pub fn start_container_idle_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.idle_poll_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = this.reap_idle().await;
                        if reaped > 0 {
                            debug!(reaped, "idle cleanup pass");
                        }
                    },
                }
            }
            debug!("idle cleanup loop stopped");
        })
    }

    /// Remove labelled containers this process does not own (left over from a
    /// previous run). Returns how many were removed.
    pub async fn cleanup_orphan_persistent_containers(&self) -> Result<usize> {
        let mut known = HashSet::new();
        for (_, slot) in self.all_slots().await {
            if let Some(handle) = slot.handle.lock().await.as_ref() {
                known.insert(handle.name.clone());
            }
        }

        let mut removed = 0;
        for container in self.runtime.list_managed().await? {
            if known.contains(&container.name) {
                continue;
            }
            info!(container = %container.name, group = %container.group, mode = %container.mode, "removing orphaned container");
            match self.runtime.kill(&container.name).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %container.name, error = %e, "failed to remove orphan"),
            }
        }
        Ok(removed)
    }

    /// Tear down everything. Used at shutdown; failures are only logged.
    pub async fn kill_all_containers(&self) {
        self.shutdown.cancel();
        let mut killed = 0;
        for (folder, slot) in self.all_slots().await {
            if let Some(token) = slot.take_run_token() {
                token.cancel();
            }
            let handle = slot.handle.lock().await.take();
            if let Some(handle) = handle {
                debug!(group = %folder, container = %handle.name, "stopping container for shutdown");
                destroy_handle(self.runtime.as_ref(), &handle).await;
                killed += 1;
            }
        }
        info!(killed, "all agent containers stopped");
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub async fn status(&self) -> Vec<HandleStatus> {
        let now = now_ms();
        let mut rows: Vec<HandleStatus> = self
            .all_slots()
            .await
            .into_iter()
            .filter_map(|(folder, slot)| {
                let busy = slot.busy.load(Ordering::SeqCst);
                match slot.handle.try_lock() {
                    Ok(current) => current.as_ref().map(|h| HandleStatus {
                        group: folder.clone(),
                        container: Some(h.name.clone()),
                        mode: Some(h.mode),
                        age_ms: now.saturating_sub(h.created_at),
                        idle_ms: now.saturating_sub(h.last_activity.load(Ordering::SeqCst)),
                        busy,
                        interrupted: h.interrupted.load(Ordering::SeqCst),
                    }),
                    Err(_) => Some(HandleStatus {
                        group: folder.clone(),
                        container: None,
                        mode: None,
                        age_ms: 0,
                        idle_ms: 0,
                        busy,
                        interrupted: false,
                    }),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.group.cmp(&b.group));
        rows
    }
}

/// Remove `handle` from the slot if it is still the current one, then destroy it.
async fn detach_and_destroy(
    runtime: &dyn ContainerRuntime,
    slot: &GroupSlot,
    handle: &Arc<ContainerHandle>,
) {
    {
        let mut current = slot.handle.lock().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, handle)) {
            current.take();
        }
    }
    destroy_handle(runtime, handle).await;
}

async fn destroy_handle(runtime: &dyn ContainerRuntime, handle: &ContainerHandle) {
    if !handle.channel.is_closed() {
        let notice = handle.channel.notify(methods::AGENT_SHUTDOWN, json!({}));
        let _ = tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT, notice).await;
    }
    handle.channel.close().await;
    if let Err(e) = runtime.kill(&handle.name).await {
        warn!(container = %handle.name, error = %e, "failed to remove container");
    }
    if let Some(mut child) = handle.child.lock().await.take() {
        let _ = child.kill().await;
    }
    debug!(container = %handle.name, "container destroyed");
}

/// Forward streamed events to whoever owns the current run.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<Event>,
    sink: Arc<std::sync::Mutex<Option<Arc<dyn AgentCallbacks>>>>,
    last_activity: Arc<AtomicU64>,
    folder: String,
) {
    while let Some(event) = events.recv().await {
        last_activity.store(now_ms(), Ordering::SeqCst);
        let target = sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match target {
            Some(callbacks) => callbacks.on_event(&folder, &AgentEvent::from(event)),
            None => trace!(group = %folder, method = %event.method, "event with no active run"),
        }
    }
}

/// Copy container stderr into the per-run log file, capped at `max_bytes`.
async fn capture_log(
    stderr: Box<dyn AsyncRead + Send + Unpin>,
    path: PathBuf,
    max_bytes: usize,
    container: String,
) {
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot create container log");
            None
        },
    };
    let mut written = 0usize;
    let mut truncated = false;
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        trace!(container = %container, line = %line, "container stderr");
        let Some(f) = file.as_mut() else {
            continue;
        };
        if truncated {
            continue;
        }
        if written + line.len() + 1 > max_bytes {
            truncated = true;
            let _ = f.write_all(b"[log truncated]\n").await;
            continue;
        }
        written += line.len() + 1;
        if f.write_all(line.as_bytes()).await.is_err() || f.write_all(b"\n").await.is_err() {
            file = None;
        }
    }
    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
}

/// `warden-<folder>-<epoch ms>`, with the folder reduced to `[a-z0-9-]`.
pub fn container_name(folder: &str, epoch_ms: u64) -> String {
    let sanitized: String = folder
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('-');
    let sanitized = if sanitized.is_empty() {
        "group"
    } else {
        sanitized
    };
    format!("warden-{sanitized}-{epoch_ms}")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("family", "warden-family-42")]
    #[case("Work_Chat", "warden-work-chat-42")]
    #[case("__", "warden-group-42")]
    fn names_are_sanitized(#[case] folder: &str, #[case] expected: &str) {
        assert_eq!(container_name(folder, 42), expected);
    }

    #[test]
    fn busy_guard_is_exclusive_and_releases() {
        let slot = GroupSlot::default();
        let guard = BusyGuard::acquire(&slot).unwrap();
        assert!(BusyGuard::acquire(&slot).is_none());
        drop(guard);
        assert!(BusyGuard::acquire(&slot).is_some());
    }

    #[test]
    fn manager_config_flattens_sections() {
        let mut cfg = WardenConfig::default();
        cfg.container.interrupt_grace_secs = 3;
        cfg.paths.data_dir = Some("/tmp/warden-data".into());
        let mc = ManagerConfig::from_config(&cfg);
        assert_eq!(mc.interrupt_grace, Duration::from_secs(3));
        assert_eq!(
            mc.ipc_dir("family"),
            PathBuf::from("/tmp/warden-data/ipc/family")
        );
    }
}
