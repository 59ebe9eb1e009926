/// Config schema types (server, assistant, paths, container, scheduler, sandbox, mounts).
use std::{path::PathBuf, time::Duration};

use {
    serde::{Deserialize, Serialize},
    warden_common::{ContainerMode, Provider},
};

use crate::{Error, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub server: ServerConfig,
    pub assistant: AssistantConfig,
    pub paths: PathsConfig,
    pub container: ContainerConfig,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub mounts: MountsConfig,
}

/// HTTP server hosting the NoVNC relay and status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7480,
        }
    }
}

/// Defaults forwarded to agent containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Name the agent answers to (also the chat trigger word).
    pub name: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub enable_thinking: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: "Andy".into(),
            provider: Provider::default(),
            model: None,
            enable_thinking: false,
        }
    }
}

/// Filesystem locations. Unset entries resolve to platform defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Mounted read-write into the main group's container at `/workspace/project`.
    pub project_root: Option<PathBuf>,
    /// Per-group working directories (`<groups_dir>/<folder>`).
    pub groups_dir: Option<PathBuf>,
    /// Database, IPC directories and the group registry.
    pub data_dir: Option<PathBuf>,
}

impl PathsConfig {
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("", "", "warden")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".warden"))
        })
    }

    #[must_use]
    pub fn groups_dir(&self) -> PathBuf {
        self.groups_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("groups"))
    }

    #[must_use]
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[must_use]
    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.data_dir().join("warden.db").display())
    }
}

/// Agent container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI binary (`docker`, `podman`, ...).
    pub cli: String,
    pub image: String,
    /// Directory holding the agent image Dockerfile; enables `ensure_image` builds.
    pub build_context: Option<PathBuf>,
    pub default_mode: ContainerMode,
    /// Upper bound for a single `agent.run` round trip.
    pub run_timeout_secs: u64,
    /// How long a new container has to announce readiness.
    pub startup_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_poll_interval_secs: u64,
    /// Grace period between an interrupt and a forced kill.
    pub interrupt_grace_secs: u64,
    /// Cap for the stderr excerpt kept in per-run container logs.
    pub max_log_bytes: usize,
    pub memory_limit: Option<String>,
    pub cpu_quota: Option<f64>,
    pub no_network: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cli: "docker".into(),
            image: "warden-agent:latest".into(),
            build_context: None,
            default_mode: ContainerMode::Persistent,
            run_timeout_secs: 30 * 60,
            startup_timeout_secs: 60,
            idle_timeout_secs: 30 * 60,
            idle_poll_interval_secs: 60,
            interrupt_grace_secs: 10,
            max_log_bytes: 256 * 1024,
            memory_limit: None,
            cpu_quota: None,
            no_network: false,
        }
    }
}

impl ContainerConfig {
    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.idle_poll_interval_secs.max(1))
    }

    #[must_use]
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.interrupt_grace_secs)
    }
}

/// Task scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    /// IANA timezone used for cron expressions. Defaults to UTC.
    pub timezone: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            timezone: None,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Parse the configured timezone, falling back to UTC when unset.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        match self.timezone.as_deref() {
            None => Ok(chrono_tz::UTC),
            Some(name) => name.parse().map_err(|_| Error::UnknownTimezone {
                timezone: name.to_string(),
            }),
        }
    }
}

/// Desktop sandbox used for browser automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub image: String,
    pub container_name: String,
    /// Port of the noVNC web UI inside the sandbox.
    pub web_port: u16,
    /// Host port the web UI is published on (0 = pick a free port).
    pub host_port: u16,
    /// Websocket path of the remote-desktop endpoint on the web UI port.
    pub ws_path: String,
    pub startup_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_poll_interval_secs: u64,
    pub password_rotation_secs: u64,
    /// Timeout for the relay's outbound connections to the sandbox.
    pub connect_timeout_secs: u64,
    /// Externally reachable base URL of this server, used in the live-view link.
    pub public_base_url: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: "warden-desktop:latest".into(),
            container_name: "warden-sandbox".into(),
            web_port: 6080,
            host_port: 0,
            ws_path: "websockify".into(),
            startup_timeout_secs: 90,
            idle_timeout_secs: 10 * 60,
            idle_poll_interval_secs: 30,
            password_rotation_secs: 60 * 60,
            connect_timeout_secs: 10,
            public_base_url: None,
        }
    }
}

impl SandboxConfig {
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.idle_poll_interval_secs.max(1))
    }

    /// `None` disables rotation.
    #[must_use]
    pub fn password_rotation(&self) -> Option<Duration> {
        (self.password_rotation_secs > 0).then(|| Duration::from_secs(self.password_rotation_secs))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Mount allowlist location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountsConfig {
    /// Defaults to `<config_dir>/mount-allowlist.json`. The file is kept outside
    /// any mounted directory so agents cannot edit it.
    pub allowlist_path: Option<PathBuf>,
}

impl MountsConfig {
    #[must_use]
    pub fn allowlist_path(&self) -> PathBuf {
        self.allowlist_path.clone().unwrap_or_else(|| {
            crate::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mount-allowlist.json")
        })
    }
}
