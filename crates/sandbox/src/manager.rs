//! Lifecycle of the shared desktop sandbox.
//!
//! One sandbox container exists per deployment. Every start and stop goes
//! through a single lifecycle lock, so concurrent callers never race two
//! containers into existence. Observers read [`SandboxStatus`] from a `watch`
//! channel; only the manager writes it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    rand::{Rng, distr::Alphanumeric},
    secrecy::{ExposeSecret, SecretString},
    serde::Serialize,
    tokio::{
        sync::{Mutex, watch},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    warden_config::SandboxConfig,
    warden_container::{ContainerRuntime, RunSpec, now_ms},
};

use crate::{Error, Result};

/// Label put on the sandbox container.
pub const LABEL_SANDBOX: &str = "warden.sandbox";
/// Where the VNC server inside the image reads its password.
pub const VNC_PASSWORD_FILE: &str = "/root/.vnc/passwd";
const PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub enabled: bool,
    pub image: String,
    pub container_name: String,
    /// NoVNC web UI port inside the container.
    pub web_port: u16,
    /// Host port to publish on; 0 picks a free one at start.
    pub host_port: u16,
    pub ws_path: String,
    pub startup_timeout: Duration,
    /// Delay between readiness probes while starting.
    pub probe_interval: Duration,
    pub idle_timeout: Duration,
    pub idle_poll_interval: Duration,
    pub password_rotation: Option<Duration>,
    pub connect_timeout: Duration,
    pub public_base_url: Option<String>,
}

impl SandboxOptions {
    #[must_use]
    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            image: cfg.image.clone(),
            container_name: cfg.container_name.clone(),
            web_port: cfg.web_port,
            host_port: cfg.host_port,
            ws_path: cfg.ws_path.trim_matches('/').to_string(),
            startup_timeout: cfg.startup_timeout(),
            probe_interval: Duration::from_millis(500),
            idle_timeout: cfg.idle_timeout(),
            idle_poll_interval: cfg.idle_poll_interval(),
            password_rotation: cfg.password_rotation(),
            connect_timeout: cfg.connect_timeout(),
            public_base_url: cfg.public_base_url.clone(),
        }
    }
}

/// Published view of the sandbox. Serializes without the password.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub running: bool,
    pub container: Option<String>,
    pub host_port: Option<u16>,
    pub leases: usize,
    pub started_at: Option<u64>,
    pub password_rotated_at: Option<u64>,
    #[serde(skip)]
    pub password: Option<SecretString>,
}

/// Holds the sandbox up until dropped.
pub struct SandboxLease {
    manager: Arc<SandboxManager>,
}

impl SandboxLease {
    /// Give the lease back. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        self.manager.release_lease();
    }
}

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    options: SandboxOptions,
    http: reqwest::Client,
    lifecycle: Mutex<()>,
    leases: AtomicUsize,
    last_activity: AtomicU64,
    status_tx: watch::Sender<SandboxStatus>,
    shutdown: CancellationToken,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, options: SandboxOptions) -> Arc<Self> {
        let (status_tx, _) = watch::channel(SandboxStatus::default());
        Arc::new(Self {
            runtime,
            options,
            http: reqwest::Client::new(),
            lifecycle: Mutex::new(()),
            leases: AtomicUsize::new(0),
            last_activity: AtomicU64::new(now_ms()),
            status_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    pub fn status(&self) -> SandboxStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SandboxStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.status_tx.borrow().running
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    /// Base URL of the sandbox web UI on the host, while running.
    pub fn backend_http_url(&self) -> Option<String> {
        let status = self.status_tx.borrow();
        status
            .running
            .then_some(status.host_port)
            .flatten()
            .map(|port| format!("http://127.0.0.1:{port}"))
    }

    /// Websocket endpoint of the remote-desktop stream, while running.
    pub fn backend_ws_url(&self) -> Option<String> {
        let status = self.status_tx.borrow();
        status
            .running
            .then_some(status.host_port)
            .flatten()
            .map(|port| format!("ws://127.0.0.1:{port}/{}", self.options.ws_path))
    }

    /// Browser link to the live view through the relay, including the current password.
    pub fn live_view_url(&self) -> Option<String> {
        let status = self.status_tx.borrow();
        if !status.running {
            return None;
        }
        let password = status.password.as_ref()?;
        let base = self
            .options
            .public_base_url
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/');
        Some(format!(
            "{base}/novnc/vnc.html?autoconnect=true&resize=scale&path=novnc/{}&password={}",
            self.options.ws_path,
            password.expose_secret()
        ))
    }

    /// Record agent activity, postponing idle shutdown.
    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::SeqCst);
    }

    /// Start the sandbox unless it is already running.
    pub async fn ensure(&self) -> Result<SandboxStatus> {
        if !self.options.enabled {
            return Err(Error::Disabled);
        }
        self.touch();

        let _guard = self.lifecycle.lock().await;
        if self.confirm_running_locked().await {
            return Ok(self.status());
        }

        let name = &self.options.container_name;
        // Leftover from a previous process.
        if let Err(e) = self.runtime.kill(name).await {
            debug!(container = %name, error = %e, "no stale sandbox removed");
        }

        let host_port = match self.options.host_port {
            0 => find_available_port()?,
            port => port,
        };
        let password = generate_password();
        let spec = RunSpec {
            name: name.clone(),
            image: self.options.image.clone(),
            labels: vec![(LABEL_SANDBOX.to_string(), "true".to_string())],
            env: vec![(
                "VNC_PASSWORD".to_string(),
                password.expose_secret().clone(),
            )],
            ports: vec![(host_port, self.options.web_port)],
            ..Default::default()
        };

        info!(container = %name, image = %self.options.image, host_port, "starting sandbox");
        if let Err(e) = self.runtime.run_detached(&spec).await {
            let _ = self.runtime.kill(name).await;
            return Err(e.into());
        }

        let probe_url = format!("http://127.0.0.1:{host_port}/");
        let ready =
            tokio::time::timeout(self.options.startup_timeout, self.wait_until_ready(&probe_url))
                .await;
        if ready.is_err() {
            warn!(
                container = %name,
                timeout_ms = self.options.startup_timeout.as_millis() as u64,
                "sandbox failed to become ready, removing it"
            );
            if let Err(e) = self.runtime.kill(name).await {
                warn!(container = %name, error = %e, "failed to remove unready sandbox");
            }
            return Err(Error::StartupTimeout {
                after_ms: self.options.startup_timeout.as_millis() as u64,
            });
        }

        let now = now_ms();
        self.last_activity.store(now, Ordering::SeqCst);
        let leases = self.lease_count();
        self.status_tx.send_replace(SandboxStatus {
            running: true,
            container: Some(name.clone()),
            host_port: Some(host_port),
            leases,
            started_at: Some(now),
            password_rotated_at: Some(now),
            password: Some(password),
        });
        info!(container = %name, host_port, "sandbox ready");
        Ok(self.status())
    }

    /// Take a lease, starting the sandbox if needed.
    ///
    /// The lease is counted before the sandbox is ensured so the idle
    /// watcher cannot reclaim it in between.
    pub async fn acquire(self: &Arc<Self>) -> Result<SandboxLease> {
        let count = self.leases.fetch_add(1, Ordering::SeqCst) + 1;
        let lease = SandboxLease {
            manager: Arc::clone(self),
        };
        self.status_tx.send_modify(|s| s.leases = count);
        self.ensure().await?;
        debug!(leases = count, "sandbox lease acquired");
        Ok(lease)
    }

    fn release_lease(&self) {
        let count = self
            .leases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map_or(0, |prev| prev.saturating_sub(1));
        self.touch();
        self.status_tx.send_modify(|s| s.leases = count);
        debug!(leases = count, "sandbox lease released");
    }

    /// Check the published status against the runtime. A container removed
    /// behind our back is marked stopped so the next `ensure` starts a new one.
    /// If the runtime cannot answer, the published status is trusted.
    async fn confirm_running_locked(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let name = &self.options.container_name;
        match self.runtime.is_running(name).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(container = %name, "sandbox container is gone, marking it stopped");
                self.mark_stopped();
                false
            },
            Err(e) => {
                debug!(container = %name, error = %e, "could not check sandbox container");
                true
            },
        }
    }

    fn mark_stopped(&self) {
        self.status_tx.send_modify(|s| {
            *s = SandboxStatus {
                leases: s.leases,
                ..Default::default()
            };
        });
    }

    /// Stop and remove the sandbox. Returns `false` when nothing was running.
    pub async fn cleanup(&self) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        self.teardown_locked().await
    }

    async fn teardown_locked(&self) -> Result<bool> {
        if !self.is_running() {
            return Ok(false);
        }
        let name = &self.options.container_name;
        self.runtime.kill(name).await?;
        self.mark_stopped();
        info!(container = %name, "sandbox stopped");
        Ok(true)
    }

    /// Stop the sandbox if nobody holds a lease and it has been idle long enough.
    /// A sandbox whose container has vanished is marked stopped here as well.
    pub async fn reap_if_idle(&self) -> bool {
        let _guard = self.lifecycle.lock().await;
        if !self.confirm_running_locked().await || self.lease_count() > 0 {
            return false;
        }
        let idle_ms = now_ms().saturating_sub(self.last_activity.load(Ordering::SeqCst));
        if idle_ms < self.options.idle_timeout.as_millis() as u64 {
            return false;
        }
        info!(idle_ms, "sandbox idle, shutting down");
        match self.teardown_locked().await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!(error = %e, "failed to stop idle sandbox");
                false
            },
        }
    }

    /// Set a fresh VNC password inside the running sandbox.
    pub async fn rotate_password(&self) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(false);
        }
        let password = generate_password();
        let command = vec![
            "x11vnc".to_string(),
            "-storepasswd".to_string(),
            password.expose_secret().clone(),
            VNC_PASSWORD_FILE.to_string(),
        ];
        let output = self
            .runtime
            .exec(&self.options.container_name, &command)
            .await?;
        if output.exit_code != 0 {
            return Err(Error::message(format!(
                "password rotation failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let now = now_ms();
        self.status_tx.send_modify(|s| {
            s.password = Some(password);
            s.password_rotated_at = Some(now);
        });
        info!("sandbox password rotated");
        Ok(true)
    }

    pub fn start_idle_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = manager.shutdown.cancelled() => break,
                    () = tokio::time::sleep(manager.options.idle_poll_interval) => {},
                }
                manager.reap_if_idle().await;
            }
            debug!("sandbox idle watcher stopped");
        })
    }

    /// Rotate the password on the configured cadence. `None` when rotation is off.
    pub fn start_password_rotation(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let every = self.options.password_rotation?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = manager.shutdown.cancelled() => break,
                    () = tokio::time::sleep(every) => {},
                }
                if let Err(e) = manager.rotate_password().await {
                    warn!(error = %e, "sandbox password rotation failed");
                }
            }
        }))
    }

    /// Stop background watchers and tear the sandbox down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.cleanup().await {
            warn!(error = %e, "sandbox cleanup at shutdown failed");
        }
    }

    async fn wait_until_ready(&self, url: &str) {
        loop {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => return,
                Ok(resp) => debug!(status = %resp.status(), "sandbox web ui not ready yet"),
                Err(e) => debug!(error = %e, "sandbox probe failed, retrying"),
            }
            tokio::time::sleep(self.options.probe_interval).await;
        }
    }
}

/// Random alphanumeric VNC password.
#[must_use]
pub fn generate_password() -> SecretString {
    let password: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect();
    SecretString::new(password)
}

fn find_available_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwords_are_eight_alphanumerics() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.expose_secret().len(), PASSWORD_LEN);
        assert!(a.expose_secret().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn status_json_has_no_password() {
        let status = SandboxStatus {
            running: true,
            password: Some(SecretString::new("hunter22".into())),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("hunter22"));
        assert!(json.contains("\"running\":true"));
    }

    #[test]
    fn options_trim_ws_path() {
        let cfg = SandboxConfig {
            ws_path: "/websockify/".into(),
            password_rotation_secs: 0,
            ..Default::default()
        };
        let options = SandboxOptions::from_config(&cfg);
        assert_eq!(options.ws_path, "websockify");
        assert!(options.password_rotation.is_none());
    }
}
