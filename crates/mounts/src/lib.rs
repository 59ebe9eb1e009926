//! Mount security policy.
//!
//! Every host directory an agent container sees beyond its defaults must be
//! approved here. The allowlist lives outside the project tree so agents can
//! never edit it, and a missing or unreadable allowlist denies everything.

pub mod allowlist;
pub mod cache;
pub mod error;
pub mod validate;

pub use {
    allowlist::{AllowedRoot, Allowlist, DEFAULT_BLOCKED_PATTERNS, generate_allowlist_template},
    cache::AllowlistCache,
    error::{Error, Result},
    validate::{
        EXTRA_MOUNT_ROOT, EffectiveMount, MountDecision, MountSpec, validate_additional_mounts,
        validate_mount,
    },
};
