//! Desktop sandbox used for browser automation: lifecycle, leases, idle
//! reclamation, password rotation and the NoVNC relay that exposes its screen.

pub mod error;
pub mod manager;
pub mod relay;

pub use {
    error::{Error, Result},
    manager::{
        LABEL_SANDBOX, SandboxLease, SandboxManager, SandboxOptions, SandboxStatus,
        generate_password,
    },
    relay::{PendingFrames, RelayFrame, router},
};
