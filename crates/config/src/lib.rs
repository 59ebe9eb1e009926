//! Configuration loading, env substitution, and the documented template.
//!
//! Config files: `warden.toml`, `warden.yaml`, `warden.yml`, or `warden.json`.
//! Searched in `./` then the user config dir (`~/.config/warden/`), unless an
//! explicit config directory is given.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod template;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        AssistantConfig, ContainerConfig, MountsConfig, PathsConfig, SandboxConfig,
        SchedulerConfig, ServerConfig, WardenConfig,
    },
    template::default_config_template,
};
