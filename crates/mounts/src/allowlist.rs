//! Allowlist document and its JSON form.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, error::Context};

/// Path fragments that are never mountable, regardless of operator config.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    "credentials",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
    "docker.sock",
];

/// A host directory under which mounts may be requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default)]
    pub allow_read_write: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowlist {
    #[serde(default)]
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub non_main_read_only: bool,
    /// Home directory used for `~` expansion, captured when the file was loaded
    /// so validation never consults the environment.
    #[serde(skip)]
    pub home: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for Allowlist {
    fn default() -> Self {
        Self {
            allowed_roots: Vec::new(),
            blocked_patterns: Vec::new(),
            non_main_read_only: true,
            home: None,
        }
    }
}

impl Allowlist {
    /// Parse an allowlist document and merge in [`DEFAULT_BLOCKED_PATTERNS`].
    pub fn from_json(raw: &str, home: Option<PathBuf>) -> Result<Self> {
        let mut list: Self = serde_json::from_str(raw)?;
        list.home = home;
        list.merge_default_blocked();
        Ok(list)
    }

    /// Read and parse an allowlist file, capturing the current user's home.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| crate::Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, home_dir())
            .with_context(|| format!("parsing allowlist {}", path.display()))
    }

    fn merge_default_blocked(&mut self) {
        for pattern in DEFAULT_BLOCKED_PATTERNS {
            if !self.blocked_patterns.iter().any(|p| p == pattern) {
                self.blocked_patterns.push((*pattern).to_string());
            }
        }
    }

    /// Expand a leading `~` and lexically normalize.
    ///
    /// Returns `None` for paths that are still relative after expansion.
    pub fn resolve_host_path(&self, raw: &str) -> Option<PathBuf> {
        let raw = raw.trim();
        let expanded = if raw == "~" {
            self.home.clone()?
        } else if let Some(rest) = raw.strip_prefix("~/") {
            self.home.as_ref()?.join(rest)
        } else {
            PathBuf::from(raw)
        };
        if !expanded.is_absolute() {
            return None;
        }
        Some(normalize_lexically(&expanded))
    }
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Resolve `.` and `..` without touching the filesystem. `..` at the root is dropped.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {},
            Component::ParentDir => {
                out.pop();
            },
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Starter allowlist printed by `warden mounts template`.
pub fn generate_allowlist_template() -> String {
    let template = Allowlist {
        allowed_roots: vec![
            AllowedRoot {
                path: "~/projects".into(),
                allow_read_write: true,
                description: Some("Development projects".into()),
            },
            AllowedRoot {
                path: "~/Documents/shared".into(),
                allow_read_write: false,
                description: Some("Reference documents (read-only)".into()),
            },
        ],
        blocked_patterns: DEFAULT_BLOCKED_PATTERNS
            .iter()
            .map(|p| (*p).to_string())
            .chain(["password".to_string(), "*.pem".to_string()])
            .collect(),
        non_main_read_only: true,
        home: None,
    };
    serde_json::to_string_pretty(&template).unwrap_or_default()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn home() -> Option<PathBuf> {
        Some(PathBuf::from("/home/ops"))
    }

    #[test]
    fn defaults_are_merged_without_duplicates() {
        let list =
            Allowlist::from_json(r#"{"blockedPatterns": [".ssh", "payroll"]}"#, home()).unwrap();
        assert_eq!(list.blocked_patterns.iter().filter(|p| *p == ".ssh").count(), 1);
        assert!(list.blocked_patterns.iter().any(|p| p == "payroll"));
        assert!(list.blocked_patterns.iter().any(|p| p == "docker.sock"));
    }

    #[test]
    fn non_main_read_only_defaults_on() {
        let list = Allowlist::from_json("{}", home()).unwrap();
        assert!(list.non_main_read_only);
        assert!(list.allowed_roots.is_empty());
    }

    #[rstest]
    #[case("~/code", Some("/home/ops/code"))]
    #[case("~", Some("/home/ops"))]
    #[case("/srv/data/./x/../y", Some("/srv/data/y"))]
    #[case("/../../etc", Some("/etc"))]
    #[case("relative/dir", None)]
    fn resolves_host_paths(#[case] raw: &str, #[case] expected: Option<&str>) {
        let list = Allowlist {
            home: home(),
            ..Default::default()
        };
        assert_eq!(list.resolve_host_path(raw), expected.map(PathBuf::from));
    }

    #[test]
    fn tilde_without_home_is_unresolvable() {
        let list = Allowlist::default();
        assert!(list.resolve_host_path("~/code").is_none());
    }

    #[test]
    fn template_round_trips() {
        let raw = generate_allowlist_template();
        let list = Allowlist::from_json(&raw, home()).unwrap();
        assert_eq!(list.allowed_roots.len(), 2);
        assert!(list.allowed_roots[0].allow_read_write);
        assert!(raw.contains("nonMainReadOnly"));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Allowlist::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, crate::Error::Read { .. }));
    }
}
