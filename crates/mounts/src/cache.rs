//! Process-wide allowlist cache.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use tracing::{info, warn};

use crate::{
    allowlist::Allowlist,
    validate::{EffectiveMount, MountDecision, MountSpec, validate_additional_mounts, validate_mount},
};

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Unloaded,
    /// Load was attempted and failed; stays closed until [`AllowlistCache::refresh`].
    Closed,
    Ready(Arc<Allowlist>),
}

/// Reads the allowlist file once and hands out shared snapshots.
///
/// Readers get an `Arc` so a concurrent [`refresh`](Self::refresh) never
/// changes an allowlist that a validation is already using.
#[derive(Debug)]
pub struct AllowlistCache {
    path: PathBuf,
    slot: RwLock<Slot>,
}

impl AllowlistCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            slot: RwLock::new(Slot::Unloaded),
        }
    }

    /// Cache pre-populated with an in-memory allowlist.
    pub fn with_allowlist(path: impl Into<PathBuf>, allowlist: Allowlist) -> Self {
        Self {
            path: path.into(),
            slot: RwLock::new(Slot::Ready(Arc::new(allowlist))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current allowlist, loading it on first use. `None` means no dynamic mounts.
    pub fn load(&self) -> Option<Arc<Allowlist>> {
        {
            let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
            match &*slot {
                Slot::Ready(list) => return Some(Arc::clone(list)),
                Slot::Closed => return None,
                Slot::Unloaded => {},
            }
        }

        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if matches!(*slot, Slot::Unloaded) {
            *slot = self.read_file();
        }
        match &*slot {
            Slot::Ready(list) => Some(Arc::clone(list)),
            _ => None,
        }
    }

    /// Re-read the file and swap the cached value.
    pub fn refresh(&self) -> Option<Arc<Allowlist>> {
        let next = self.read_file();
        let current = match &next {
            Slot::Ready(list) => Some(Arc::clone(list)),
            _ => None,
        };
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = next;
        current
    }

    fn read_file(&self) -> Slot {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "mount allowlist not found, additional mounts disabled");
            return Slot::Closed;
        }
        match Allowlist::load(&self.path) {
            Ok(list) => {
                info!(
                    path = %self.path.display(),
                    roots = list.allowed_roots.len(),
                    blocked = list.blocked_patterns.len(),
                    "mount allowlist loaded"
                );
                Slot::Ready(Arc::new(list))
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "mount allowlist unusable, additional mounts disabled");
                Slot::Closed
            },
        }
    }

    pub fn validate(&self, spec: &MountSpec, is_main: bool) -> MountDecision {
        let list = self.load();
        validate_mount(spec, is_main, list.as_deref())
    }

    pub fn validate_all(
        &self,
        specs: &[MountSpec],
        group_folder: &str,
        is_main: bool,
    ) -> Vec<EffectiveMount> {
        if specs.is_empty() {
            return Vec::new();
        }
        let list = self.load();
        validate_additional_mounts(specs, group_folder, is_main, list.as_deref())
    }
}
