//! Pure mount validation.

use std::path::{Path, PathBuf};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::allowlist::{AllowedRoot, Allowlist};

/// Container directory under which every additional mount is placed.
pub const EXTRA_MOUNT_ROOT: &str = "/workspace/extra";

/// Characters that would corrupt the runtime's `--mount` argument.
const RESERVED_CHARS: &[char] = &[',', '\n', '\r', '\0'];

/// A requested bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub allow_read_write: bool,
}

/// What actually gets handed to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveMount {
    pub host_path: PathBuf,
    /// Absolute path inside the container.
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective: Option<EffectiveMount>,
}

impl MountDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            effective: None,
        }
    }
}

/// Decide whether `spec` may be mounted for a group.
///
/// Deterministic for a given allowlist and `is_main`; never reads the filesystem.
pub fn validate_mount(spec: &MountSpec, is_main: bool, allowlist: Option<&Allowlist>) -> MountDecision {
    let Some(allowlist) = allowlist else {
        return MountDecision::reject("no mount allowlist configured");
    };

    let container_rel = match check_container_path(&spec.container_path) {
        Ok(rel) => rel,
        Err(reason) => return MountDecision::reject(reason),
    };

    if spec.host_path.contains(RESERVED_CHARS) {
        return MountDecision::reject("host path contains a reserved character");
    }
    let Some(host) = allowlist.resolve_host_path(&spec.host_path) else {
        return MountDecision::reject(format!(
            "host path {:?} is not absolute",
            spec.host_path
        ));
    };

    let Some(root) = matching_root(allowlist, &host) else {
        return MountDecision::reject(format!(
            "{} is not under any allowed root",
            host.display()
        ));
    };

    if let Some(pattern) = blocked_by(&allowlist.blocked_patterns, &host) {
        return MountDecision::reject(format!(
            "{} matches blocked pattern {pattern:?}",
            host.display()
        ));
    }

    let mut reason = format!("allowed under root {}", root.path);
    let read_only = if !spec.allow_read_write {
        true
    } else if !is_main && allowlist.non_main_read_only {
        return MountDecision::reject("non-main groups may only mount read-only");
    } else if !root.allow_read_write {
        reason.push_str(" (downgraded to read-only)");
        true
    } else {
        false
    };

    MountDecision {
        allowed: true,
        reason,
        effective: Some(EffectiveMount {
            host_path: host,
            container_path: format!("{EXTRA_MOUNT_ROOT}/{container_rel}"),
            read_only,
        }),
    }
}

/// Validate a batch, keeping only accepted mounts. Rejections are logged.
pub fn validate_additional_mounts(
    specs: &[MountSpec],
    group_folder: &str,
    is_main: bool,
    allowlist: Option<&Allowlist>,
) -> Vec<EffectiveMount> {
    specs
        .iter()
        .filter_map(|spec| {
            let decision = validate_mount(spec, is_main, allowlist);
            match decision.effective {
                Some(mount) => {
                    debug!(group = group_folder, host = %mount.host_path.display(), container = %mount.container_path, read_only = mount.read_only, "mount accepted");
                    Some(mount)
                },
                None => {
                    warn!(group = group_folder, host = %spec.host_path, container = %spec.container_path, reason = %decision.reason, "mount rejected");
                    None
                },
            }
        })
        .collect()
}

/// Returns the normalized relative container path, or a rejection reason.
fn check_container_path(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("container path is empty".into());
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(format!("container path {raw:?} must be relative"));
    }
    if trimmed.contains(RESERVED_CHARS) || trimmed.contains(':') {
        return Err(format!("container path {raw:?} contains a reserved character"));
    }
    let segments: Vec<&str> = trimmed
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.iter().any(|s| *s == "..") {
        return Err(format!("container path {raw:?} contains '..'"));
    }
    if segments.is_empty() {
        return Err("container path is empty".into());
    }
    Ok(segments.join("/"))
}

/// Most specific allowed root containing `host`.
fn matching_root<'a>(allowlist: &'a Allowlist, host: &Path) -> Option<&'a AllowedRoot> {
    allowlist
        .allowed_roots
        .iter()
        .filter_map(|root| {
            let resolved = allowlist.resolve_host_path(&root.path)?;
            host.starts_with(&resolved)
                .then_some((resolved.components().count(), root))
        })
        .max_by_key(|(depth, _)| *depth)
        .map(|(_, root)| root)
}

fn blocked_by<'a>(patterns: &'a [String], host: &Path) -> Option<&'a str> {
    let full = host.to_string_lossy();
    let components: Vec<String> = host
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    patterns
        .iter()
        .map(String::as_str)
        .filter(|p| !p.trim().is_empty())
        .find(|pattern| {
            if pattern.contains(['*', '?']) {
                match glob_regex(pattern) {
                    Some(re) => re.is_match(&full) || components.iter().any(|c| re.is_match(c)),
                    // An unusable pattern blocks nothing rather than everything.
                    None => false,
                }
            } else {
                components.iter().any(|c| c == pattern) || full.contains(pattern)
            }
        })
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_regex(pattern: &str) -> Option<regex::Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr).ok()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn allowlist() -> Allowlist {
        Allowlist::from_json(
            r#"{
                "allowedRoots": [
                    {"path": "~/projects", "allowReadWrite": true},
                    {"path": "/srv/shared", "allowReadWrite": false},
                    {"path": "/srv/shared/scratch", "allowReadWrite": true}
                ],
                "blockedPatterns": ["*.pem", "secret-?"],
                "nonMainReadOnly": true
            }"#,
            Some(PathBuf::from("/home/ops")),
        )
        .unwrap()
    }

    fn spec(host: &str, container: &str, rw: bool) -> MountSpec {
        MountSpec {
            host_path: host.into(),
            container_path: container.into(),
            allow_read_write: rw,
        }
    }

    #[rstest]
    #[case("../escape")]
    #[case("data/../../escape")]
    #[case("/absolute")]
    #[case("")]
    #[case("   ")]
    #[case("./")]
    #[case("a:b")]
    fn bad_container_paths_always_rejected(#[case] container: &str) {
        let list = allowlist();
        for is_main in [true, false] {
            let d = validate_mount(&spec("~/projects/app", container, false), is_main, Some(&list));
            assert!(!d.allowed, "{container:?} main={is_main}");
            assert!(d.effective.is_none());
        }
    }

    #[test]
    fn missing_allowlist_fails_closed() {
        let d = validate_mount(&spec("/srv/shared/a", "a", false), true, None);
        assert!(!d.allowed);
        assert!(d.reason.contains("allowlist"));
    }

    #[test]
    fn accepted_mount_lands_under_extra() {
        let d = validate_mount(&spec("~/projects/app", "./app//src", true), true, Some(&allowlist()));
        assert!(d.allowed, "{}", d.reason);
        let m = d.effective.unwrap();
        assert_eq!(m.host_path, PathBuf::from("/home/ops/projects/app"));
        assert_eq!(m.container_path, "/workspace/extra/app/src");
        assert!(!m.read_only);
    }

    #[rstest]
    #[case("/etc/passwd")]
    #[case("/home/ops/projects-evil")]
    #[case("/home/ops/projects/../.ssh")]
    #[case("relative/path")]
    fn outside_roots_rejected(#[case] host: &str) {
        let d = validate_mount(&spec(host, "x", false), true, Some(&allowlist()));
        assert!(!d.allowed, "{host}");
    }

    #[rstest]
    #[case("~/projects/app/.ssh")]
    #[case("~/projects/app/.env.local")]
    #[case("~/projects/certs/server.pem")]
    #[case("~/projects/secret-1")]
    #[case("~/projects/aws/credentials")]
    fn blocked_patterns_rejected(#[case] host: &str) {
        let d = validate_mount(&spec(host, "x", false), true, Some(&allowlist()));
        assert!(!d.allowed, "{host}");
        assert!(d.reason.contains("blocked"));
    }

    #[test]
    fn non_main_never_gets_write() {
        let list = allowlist();
        for host in ["~/projects/app", "/srv/shared/scratch/tmp", "/srv/shared/docs"] {
            let d = validate_mount(&spec(host, "x", true), false, Some(&list));
            assert!(d.effective.is_none_or(|m| m.read_only), "{host}");
        }
        let d = validate_mount(&spec("~/projects/app", "x", false), false, Some(&list));
        assert!(d.allowed);
        assert!(d.effective.unwrap().read_only);
    }

    #[test]
    fn non_main_write_allowed_when_policy_off() {
        let mut list = allowlist();
        list.non_main_read_only = false;
        let d = validate_mount(&spec("~/projects/app", "x", true), false, Some(&list));
        assert!(!d.effective.unwrap().read_only);
    }

    #[test]
    fn read_only_root_downgrades_write() {
        let d = validate_mount(&spec("/srv/shared/docs", "docs", true), true, Some(&allowlist()));
        assert!(d.allowed);
        assert!(d.reason.contains("downgraded"));
        assert!(d.effective.unwrap().read_only);
    }

    #[test]
    fn most_specific_root_wins() {
        let d = validate_mount(&spec("/srv/shared/scratch/a", "a", true), true, Some(&allowlist()));
        assert!(!d.effective.unwrap().read_only);
    }

    #[test]
    fn validation_is_deterministic() {
        let list = allowlist();
        let s = spec("~/projects/app", "app", true);
        let first = validate_mount(&s, false, Some(&list));
        for _ in 0..10 {
            assert_eq!(validate_mount(&s, false, Some(&list)), first);
        }
    }

    #[test]
    fn batch_filters_rejections() {
        let specs = vec![
            spec("~/projects/app", "app", false),
            spec("/etc", "etc", false),
            spec("/srv/shared/docs", "../docs", false),
        ];
        let accepted = validate_additional_mounts(&specs, "family", false, Some(&allowlist()));
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].container_path, "/workspace/extra/app");
    }
}
