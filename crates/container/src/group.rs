//! Registered groups and their persistence.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
    warden_common::{ContainerMode, Provider},
    warden_mounts::MountSpec,
};

use crate::{Error, Result, now_ms};

/// Folder name reserved for the shared read-only directory.
pub const GLOBAL_FOLDER: &str = "global";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Stable identifier; also the group's directory name.
    pub folder: String,
    pub name: String,
    pub trigger: String,
    pub chat_jid: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub container_mode: ContainerMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_mounts: Vec<MountSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub added_at: u64,
}

fn default_active() -> bool {
    true
}

impl Group {
    pub fn new(folder: impl Into<String>, name: impl Into<String>, chat_jid: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
            trigger: String::new(),
            chat_jid: chat_jid.into(),
            provider: Provider::default(),
            model: None,
            is_main: false,
            container_mode: ContainerMode::default(),
            additional_mounts: Vec::new(),
            timeout_ms: None,
            active: true,
            added_at: 0,
        }
    }
}

/// Reject folder names that could escape the groups directory.
pub fn validate_folder(folder: &str) -> Result<()> {
    let reason = if folder.is_empty() {
        Some("empty")
    } else if folder.len() > 64 {
        Some("longer than 64 characters")
    } else if folder == GLOBAL_FOLDER {
        Some("reserved")
    } else if !folder
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Some("only ASCII letters, digits, '-' and '_' are allowed")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidFolder {
            folder: folder.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// In-memory group table backed by `groups.json`.
pub struct GroupRegistry {
    path: Option<PathBuf>,
    groups: RwLock<BTreeMap<String, Group>>,
}

impl GroupRegistry {
    /// Registry that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load `path`, starting empty when it does not exist yet.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let groups = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let list: Vec<Group> = serde_json::from_str(&raw)?;
                info!(path = %path.display(), count = list.len(), "loaded groups");
                list.into_iter().map(|g| (g.folder.clone(), g)).collect()
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no groups file yet");
                BTreeMap::new()
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            groups: RwLock::new(groups),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or update a group. The registration timestamp of an existing
    /// group is preserved.
    pub async fn register(&self, mut group: Group) -> Result<Group> {
        validate_folder(&group.folder)?;
        let mut groups = self.groups.write().await;
        if let Some(other) = groups
            .values()
            .find(|g| g.chat_jid == group.chat_jid && g.folder != group.folder)
        {
            return Err(Error::message(format!(
                "chat {} is already registered as group {}",
                group.chat_jid, other.folder
            )));
        }
        group.added_at = groups
            .get(&group.folder)
            .map_or_else(now_ms, |existing| existing.added_at);
        groups.insert(group.folder.clone(), group.clone());
        self.persist(&groups).await?;
        info!(folder = %group.folder, main = group.is_main, mode = %group.container_mode, "group registered");
        Ok(group)
    }

    /// Groups are never removed, only deactivated.
    pub async fn deactivate(&self, folder: &str) -> Result<Group> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(folder).ok_or_else(|| Error::UnknownGroup {
            folder: folder.to_string(),
        })?;
        group.active = false;
        let updated = group.clone();
        self.persist(&groups).await?;
        info!(folder, "group deactivated");
        Ok(updated)
    }

    pub async fn get(&self, folder: &str) -> Option<Group> {
        self.groups.read().await.get(folder).cloned()
    }

    pub async fn by_chat_jid(&self, chat_jid: &str) -> Option<Group> {
        self.groups
            .read()
            .await
            .values()
            .find(|g| g.chat_jid == chat_jid)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Group> {
        self.groups.read().await.values().cloned().collect()
    }

    async fn persist(&self, groups: &BTreeMap<String, Group>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list: Vec<&Group> = groups.values().collect();
        let raw = serde_json::to_string_pretty(&list)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!(path = %path.display(), error = %e, "failed to replace groups file");
            return Err(e.into());
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("family")]
    #[case("work_chat-2")]
    fn accepts_plain_folders(#[case] folder: &str) {
        assert!(validate_folder(folder).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("global")]
    #[case("../etc")]
    #[case("a/b")]
    #[case("with space")]
    fn rejects_unsafe_folders(#[case] folder: &str) {
        assert!(matches!(
            validate_folder(folder),
            Err(Error::InvalidFolder { .. })
        ));
    }

    #[tokio::test]
    async fn register_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        let registry = GroupRegistry::load(&path).await.unwrap();

        let mut main = Group::new("main", "Main", "main@g.us");
        main.is_main = true;
        registry.register(main).await.unwrap();
        registry
            .register(Group::new("family", "Family", "fam@g.us"))
            .await
            .unwrap();

        let reloaded = GroupRegistry::load(&path).await.unwrap();
        assert_eq!(reloaded.list().await.len(), 2);
        assert!(reloaded.get("main").await.unwrap().is_main);
        assert_eq!(
            reloaded.by_chat_jid("fam@g.us").await.unwrap().folder,
            "family"
        );
    }

    #[tokio::test]
    async fn reregistering_keeps_added_at() {
        let registry = GroupRegistry::in_memory();
        let first = registry
            .register(Group::new("family", "Family", "fam@g.us"))
            .await
            .unwrap();
        let mut renamed = Group::new("family", "The Family", "fam@g.us");
        renamed.container_mode = ContainerMode::OneShot;
        let second = registry.register(renamed).await.unwrap();
        assert_eq!(first.added_at, second.added_at);
        assert_eq!(second.name, "The Family");
    }

    #[tokio::test]
    async fn duplicate_chat_is_rejected() {
        let registry = GroupRegistry::in_memory();
        registry
            .register(Group::new("family", "Family", "fam@g.us"))
            .await
            .unwrap();
        assert!(
            registry
                .register(Group::new("family2", "Family", "fam@g.us"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn deactivate_keeps_group() {
        let registry = GroupRegistry::in_memory();
        registry
            .register(Group::new("family", "Family", "fam@g.us"))
            .await
            .unwrap();
        let g = registry.deactivate("family").await.unwrap();
        assert!(!g.active);
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.deactivate("ghost").await.is_err());
    }
}
