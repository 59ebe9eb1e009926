use std::path::Path;

use {anyhow::Result, clap::Subcommand, warden_config::WardenConfig};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print a commented `warden.toml` with every option at its default.
    Template,
    /// Print the effective configuration after discovery and overrides.
    Show {
        /// Emit JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
}

pub fn handle_config(
    action: ConfigAction,
    config: &WardenConfig,
    config_dir: Option<&Path>,
) -> Result<()> {
    match action {
        ConfigAction::Template => {
            print!("{}", warden_config::default_config_template());
            Ok(())
        },
        ConfigAction::Show { json } => {
            match warden_config::find_config_file(config_dir) {
                Some(path) => eprintln!("# loaded from {}", path.display()),
                None => eprintln!("# no config file found, showing defaults"),
            }
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print!("{}", toml::to_string_pretty(config)?);
            }
            Ok(())
        },
    }
}
