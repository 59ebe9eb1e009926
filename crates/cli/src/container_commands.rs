use std::sync::Arc;

use {
    anyhow::Result,
    clap::Subcommand,
    warden_config::WardenConfig,
    warden_container::{ContainerManager, ContainerRuntime, DockerRuntime, GroupRegistry, ManagerConfig},
    warden_mounts::AllowlistCache,
};

use crate::group_commands::registry_path;

#[derive(Subcommand)]
pub enum ContainerAction {
    /// List containers carrying the warden label.
    List,
    /// Remove labelled containers left over from a previous process.
    Cleanup {
        /// Also remove the desktop sandbox container.
        #[arg(long)]
        sandbox: bool,
    },
}

pub async fn handle_containers(action: ContainerAction, config: &WardenConfig) -> Result<()> {
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(config.container.cli.clone()));
    match action {
        ContainerAction::List => {
            let containers = runtime.list_managed().await?;
            if containers.is_empty() {
                println!("No warden containers.");
            }
            for c in containers {
                println!("  {:<40} {:<20} {}", c.name, c.group, c.mode);
            }
            Ok(())
        },
        ContainerAction::Cleanup { sandbox } => {
            let removed = cleanup(runtime, config, sandbox).await?;
            println!("Removed {removed} container(s)");
            Ok(())
        },
    }
}

/// Nothing is running in this process, so every labelled container is an orphan.
async fn cleanup(
    runtime: Arc<dyn ContainerRuntime>,
    config: &WardenConfig,
    sandbox: bool,
) -> Result<usize> {
    let groups = Arc::new(GroupRegistry::load(registry_path(config)).await?);
    let allowlist = Arc::new(AllowlistCache::new(config.mounts.allowlist_path()));
    let manager = ContainerManager::new(
        Arc::clone(&runtime),
        ManagerConfig::from_config(config),
        allowlist,
        groups,
    );
    let mut removed = manager.cleanup_orphan_persistent_containers().await?;
    if sandbox && runtime.is_running(&config.sandbox.container_name).await? {
        runtime.kill(&config.sandbox.container_name).await?;
        removed += 1;
    }
    Ok(removed)
}
