use {
    anyhow::Result,
    clap::Subcommand,
    warden_config::WardenConfig,
    warden_mounts::{Allowlist, MountSpec, validate_mount},
};

#[derive(Subcommand)]
pub enum MountAction {
    /// Print an allowlist template to start from.
    Template,
    /// Check a mount against the configured allowlist.
    Check {
        /// Host directory to mount.
        host: String,
        /// Path relative to /workspace/extra inside the container.
        container: String,
        /// Request a read-write mount.
        #[arg(long)]
        rw: bool,
        /// Evaluate as the main group.
        #[arg(long)]
        main: bool,
    },
}

pub fn handle_mounts(action: MountAction, config: &WardenConfig) -> Result<()> {
    match action {
        MountAction::Template => {
            println!("{}", warden_mounts::generate_allowlist_template());
            eprintln!(
                "# save as {} (outside any directory agents can mount)",
                config.mounts.allowlist_path().display()
            );
            Ok(())
        },
        MountAction::Check {
            host,
            container,
            rw,
            main,
        } => {
            let path = config.mounts.allowlist_path();
            let allowlist = match Allowlist::load(&path) {
                Ok(list) => Some(list),
                Err(e) => {
                    eprintln!("allowlist {} unusable: {e}", path.display());
                    None
                },
            };
            let spec = MountSpec {
                host_path: host,
                container_path: container,
                allow_read_write: rw,
            };
            let decision = validate_mount(&spec, main, allowlist.as_ref());
            if let Some(effective) = &decision.effective {
                println!(
                    "allowed: {} -> {} ({})",
                    effective.host_path.display(),
                    effective.container_path,
                    if effective.read_only { "ro" } else { "rw" }
                );
                println!("  {}", decision.reason);
            } else {
                println!("rejected: {}", decision.reason);
            }
            Ok(())
        },
    }
}
