use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{Error, Result, env_subst::substitute_env, schema::WardenConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["warden.toml", "warden.yaml", "warden.yml", "warden.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `<override_dir>/warden.{toml,yaml,yml,json}` when an override is given
/// 2. `./warden.{toml,yaml,yml,json}` (project-local)
/// 3. `~/.config/warden/warden.{toml,yaml,yml,json}` (user-global)
///
/// Returns `WardenConfig::default()` if no config file is found or the file
/// fails to parse.
pub fn discover_and_load(override_dir: Option<&Path>) -> WardenConfig {
    if let Some(path) = find_config_file(override_dir) {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    WardenConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file(override_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = override_dir {
        return first_existing(dir);
    }

    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|d| first_existing(&d)))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/warden/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "warden").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<WardenConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}
