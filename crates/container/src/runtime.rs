//! Container runtime backends.
//!
//! The manager only needs a handful of primitives (run, kill, list, exec,
//! image checks), so the runtime sits behind [`ContainerRuntime`]. The
//! production backend shells out to the `docker` CLI (or any CLI with the same
//! surface, such as `podman`).

use std::{ffi::OsStr, path::Path, process::Stdio};

use {
    async_trait::async_trait,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        process::{Child, Command},
    },
    tracing::{debug, info, warn},
};

use crate::{Error, Result, error::Context};

/// Label marking every container this process creates.
pub const LABEL_MANAGED: &str = "warden.managed";
/// Label carrying the owning group folder.
pub const LABEL_GROUP: &str = "warden.group";
/// Label carrying the container mode (`persistent` / `one-shot`).
pub const LABEL_MODE: &str = "warden.mode";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: std::path::PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl BindMount {
    fn to_arg(&self) -> String {
        let mut arg = format!(
            "type=bind,source={},target={}",
            self.host_path.display(),
            self.container_path
        );
        if self.read_only {
            arg.push_str(",readonly");
        }
        arg
    }
}

/// Everything needed to start one container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub labels: Vec<(String, String)>,
    pub mounts: Vec<BindMount>,
    pub env: Vec<(String, String)>,
    /// `(host, container)` port pairs.
    pub ports: Vec<(u16, u16)>,
    pub memory_limit: Option<String>,
    pub cpu_quota: Option<f64>,
    pub no_network: bool,
    /// Command override; the image entrypoint runs when empty.
    pub command: Vec<String>,
}

impl RunSpec {
    fn resource_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref mem) = self.memory_limit {
            args.extend(["--memory".to_string(), mem.clone()]);
        }
        if let Some(cpu) = self.cpu_quota {
            args.extend(["--cpus".to_string(), cpu.to_string()]);
        }
        if self.no_network {
            args.push("--network=none".to_string());
        }
        args
    }

    /// Arguments after `run`, excluding mode flags (`-i` / `-d`).
    fn run_args(&self) -> Vec<String> {
        let mut args = vec!["--name".to_string(), self.name.clone()];
        for (key, value) in &self.labels {
            args.extend(["--label".to_string(), format!("{key}={value}")]);
        }
        for mount in &self.mounts {
            args.extend(["--mount".to_string(), mount.to_arg()]);
        }
        for (key, value) in &self.env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        for (host, container) in &self.ports {
            args.extend(["-p".to_string(), format!("127.0.0.1:{host}:{container}")]);
        }
        args.extend(self.resource_args());
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// An attached container: the agent speaks the RPC protocol on stdin/stdout.
pub struct SpawnedContainer {
    pub name: String,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// The local CLI process, when the backend has one.
    pub child: Option<Child>,
}

/// A container found by label at reconciliation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub name: String,
    pub group: String,
    pub mode: String,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Backend name for logs (e.g. "docker").
    fn name(&self) -> &str;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn build_image(&self, image: &str, context: &Path) -> Result<()>;

    /// Start an interactive container with stdio attached.
    async fn spawn(&self, spec: &RunSpec) -> Result<SpawnedContainer>;

    /// Start a detached container, returning once the runtime accepted it.
    async fn run_detached(&self, spec: &RunSpec) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput>;

    /// Forcefully stop and remove. Removing an absent container is not an error.
    async fn kill(&self, name: &str) -> Result<()>;

    /// All containers carrying the [`LABEL_MANAGED`] label, running or not.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>>;
}

/// Runtime driven through the `docker` CLI.
pub struct DockerRuntime {
    cli: String,
}

impl DockerRuntime {
    pub fn new(cli: impl Into<String>) -> Self {
        Self { cli: cli.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cli);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn output<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<std::process::Output> {
        let verb = args
            .first()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .unwrap_or_default();
        self.command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {} {verb}", self.cli))
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

fn failure(cli: &str, verb: &str, output: &std::process::Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    Error::runtime(format!("{cli} {verb} failed: {}", stderr.trim()))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        &self.cli
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self
            .output(&["image", "inspect", image])
            .await?;
        Ok(output.status.success())
    }

    async fn build_image(&self, image: &str, context: &Path) -> Result<()> {
        info!(image, context = %context.display(), "building agent image");
        let output = self
            .command()
            .args(["build", "-t", image])
            .arg(context)
            .output()
            .await
            .with_context(|| format!("failed to run {} build", self.cli))?;
        if !output.status.success() {
            return Err(failure(&self.cli, "build", &output));
        }
        Ok(())
    }

    async fn spawn(&self, spec: &RunSpec) -> Result<SpawnedContainer> {
        let mut args = vec!["run".to_string(), "-i".to_string(), "--rm".to_string()];
        args.extend(spec.run_args());
        debug!(cli = %self.cli, name = %spec.name, "spawning attached container");

        let mut child = Command::new(&self.cli)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {} run", self.cli))?;

        let stdin = child.stdin.take().context("failed to capture container stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture container stdout")?;
        let stderr = child.stderr.take();

        Ok(SpawnedContainer {
            name: spec.name.clone(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            child: Some(child),
        })
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<()> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        args.extend(spec.run_args());
        let output = self.output(&args).await?;
        if !output.status.success() {
            return Err(failure(&self.cli, "run", &output));
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let output = self
            .output(&["inspect", "--format", "{{.State.Running}}", name])
            .await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(command.iter().cloned());
        let output = self.output(&args).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let output = self.output(&["rm", "-f", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Ok(());
            }
            warn!(name, error = %stderr.trim(), "container removal failed");
            return Err(failure(&self.cli, "rm", &output));
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let format = format!(
            "{{{{.Names}}}}\t{{{{.Label \"{LABEL_GROUP}\"}}}}\t{{{{.Label \"{LABEL_MODE}\"}}}}"
        );
        let output = self
            .output(&[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("label={LABEL_MANAGED}=true"),
                "--format".to_string(),
                format,
            ])
            .await?;
        if !output.status.success() {
            return Err(failure(&self.cli, "ps", &output));
        }
        Ok(parse_ps_lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_ps_lines(stdout: &str) -> Vec<ManagedContainer> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.split('\t');
            ManagedContainer {
                name: parts.next().unwrap_or_default().trim().to_string(),
                group: parts.next().unwrap_or_default().trim().to_string(),
                mode: parts.next().unwrap_or_default().trim().to_string(),
            }
        })
        .filter(|c| !c.name.is_empty())
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_include_labels_mounts_and_limits() {
        let spec = RunSpec {
            name: "warden-family-1".into(),
            image: "warden-agent:latest".into(),
            labels: vec![(LABEL_MANAGED.into(), "true".into())],
            mounts: vec![BindMount {
                host_path: "/srv/groups/family".into(),
                container_path: "/workspace/group".into(),
                read_only: true,
            }],
            env: vec![("TZ".into(), "UTC".into())],
            memory_limit: Some("2g".into()),
            no_network: true,
            ..Default::default()
        };
        let args = spec.run_args();
        let joined = args.join(" ");
        assert!(joined.starts_with("--name warden-family-1"));
        assert!(joined.contains("--label warden.managed=true"));
        assert!(joined.contains(
            "--mount type=bind,source=/srv/groups/family,target=/workspace/group,readonly"
        ));
        assert!(joined.contains("--memory 2g"));
        assert!(joined.contains("--network=none"));
        assert_eq!(args.last().unwrap(), "warden-agent:latest");
    }

    #[test]
    fn ports_bind_loopback_only() {
        let spec = RunSpec {
            name: "sb".into(),
            image: "desk".into(),
            ports: vec![(49152, 6080)],
            ..Default::default()
        };
        assert!(spec.run_args().contains(&"127.0.0.1:49152:6080".to_string()));
    }

    #[test]
    fn parses_ps_output() {
        let out = "warden-main-1\tmain\tpersistent\nwarden-fam-2\tfam\tone-shot\n\n";
        let parsed = parse_ps_lines(out);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].group, "fam");
        assert_eq!(parsed[1].mode, "one-shot");
    }
}
