use {
    anyhow::Result,
    clap::Subcommand,
    warden_common::{ContainerMode, Provider},
    warden_config::WardenConfig,
    warden_container::{Group, GroupRegistry},
};

#[derive(Subcommand)]
pub enum GroupAction {
    /// List registered groups.
    List,
    /// Register or update a group.
    Register {
        /// Folder name (letters, digits, '-' and '_').
        folder: String,
        /// Chat identifier the group is bound to.
        #[arg(long)]
        chat: String,
        /// Display name; defaults to the folder.
        #[arg(long)]
        name: Option<String>,
        /// Trigger word; defaults to the assistant name.
        #[arg(long)]
        trigger: Option<String>,
        /// Mark as the privileged main group.
        #[arg(long)]
        main: bool,
        /// Destroy the container after every run.
        #[arg(long)]
        one_shot: bool,
        #[arg(long)]
        provider: Option<Provider>,
        #[arg(long)]
        model: Option<String>,
        /// Per-run timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Deactivate a group. Its files and tasks are kept.
    Deactivate { folder: String },
}

pub fn registry_path(config: &WardenConfig) -> std::path::PathBuf {
    config.paths.data_dir().join("groups.json")
}

pub async fn handle_groups(action: GroupAction, config: &WardenConfig) -> Result<()> {
    let registry = GroupRegistry::load(registry_path(config)).await?;
    match action {
        GroupAction::List => {
            let groups = registry.list().await;
            if groups.is_empty() {
                println!("No groups registered.");
            }
            for g in groups {
                println!(
                    "  {:<20} {:<28} {:<10} {}{}",
                    g.folder,
                    g.chat_jid,
                    g.container_mode.as_str(),
                    if g.is_main { "main" } else { "" },
                    if g.active { "" } else { " (inactive)" },
                );
            }
        },
        GroupAction::Register {
            folder,
            chat,
            name,
            trigger,
            main,
            one_shot,
            provider,
            model,
            timeout_secs,
        } => {
            let mut group = match registry.get(&folder).await {
                Some(existing) => existing,
                None => Group::new(folder.clone(), folder.clone(), chat.clone()),
            };
            group.chat_jid = chat;
            group.active = true;
            group.is_main = main;
            if let Some(name) = name {
                group.name = name;
            }
            group.trigger = trigger.unwrap_or_else(|| format!("@{}", config.assistant.name));
            group.container_mode = if one_shot {
                ContainerMode::OneShot
            } else {
                config.container.default_mode
            };
            group.provider = provider.unwrap_or(config.assistant.provider);
            group.model = model.or_else(|| config.assistant.model.clone());
            if let Some(secs) = timeout_secs {
                group.timeout_ms = Some(secs.saturating_mul(1000));
            }
            let group = registry.register(group).await?;
            println!("Registered group '{}' for {}", group.folder, group.chat_jid);
        },
        GroupAction::Deactivate { folder } => {
            registry.deactivate(&folder).await?;
            println!("Deactivated group '{folder}'");
        },
    }
    Ok(())
}
