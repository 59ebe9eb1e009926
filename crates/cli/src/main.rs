mod config_commands;
mod container_commands;
mod group_commands;
mod mount_commands;
mod serve;
mod task_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
    warden_config::WardenConfig,
};

#[derive(Parser)]
#[command(name = "warden", about = "Warden: containerised assistant orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding `warden.toml` (overrides discovery).
    #[arg(long, global = true, env = "WARDEN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Data directory for the database, IPC files and group registry.
    #[arg(long, global = true, env = "WARDEN_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, container manager and relay (default).
    Serve {
        /// Address to bind to (overrides config value).
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides config value).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Scheduled task management.
    Tasks {
        #[command(subcommand)]
        action: task_commands::TaskAction,
    },
    /// Group registry management.
    Groups {
        #[command(subcommand)]
        action: group_commands::GroupAction,
    },
    /// Mount allowlist helpers.
    Mounts {
        #[command(subcommand)]
        action: mount_commands::MountAction,
    },
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Agent container maintenance.
    Containers {
        #[command(subcommand)]
        action: container_commands::ContainerAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Discovered config with command-line directory overrides applied.
fn load_config(cli: &Cli) -> WardenConfig {
    let mut config = warden_config::discover_and_load(cli.config_dir.as_deref());
    if let Some(dir) = &cli.data_dir {
        config.paths.data_dir = Some(dir.clone());
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = load_config(&cli);
    match cli.command {
        None => {
            info!(version = env!("CARGO_PKG_VERSION"), "warden starting");
            serve::run(config).await
        },
        Some(Commands::Serve { bind, port }) => {
            info!(version = env!("CARGO_PKG_VERSION"), "warden starting");
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve::run(config).await
        },
        Some(Commands::Tasks { action }) => task_commands::handle_tasks(action, &config).await,
        Some(Commands::Groups { action }) => group_commands::handle_groups(action, &config).await,
        Some(Commands::Mounts { action }) => mount_commands::handle_mounts(action, &config),
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, &config, cli.config_dir.as_deref())
        },
        Some(Commands::Containers { action }) => {
            container_commands::handle_containers(action, &config).await
        },
    }
}
