//! Agent container orchestration: runtime backend, RPC channel, group
//! registry and the per-group lifecycle manager.

pub mod error;
pub mod group;
pub mod manager;
pub mod rpc;
pub mod runtime;
pub mod types;

pub use {
    error::{Error, Result},
    group::{Group, GroupRegistry, validate_folder},
    manager::{ContainerManager, ManagerConfig, container_name},
    rpc::{RequestHandler, RpcChannel},
    runtime::{
        BindMount, ContainerRuntime, DockerRuntime, ExecOutput, ManagedContainer, RunSpec,
        SpawnedContainer,
    },
    types::{
        AgentCallbacks, AgentEvent, ContainerInput, ContainerOutput, GroupSnapshot, HandleStatus,
        InterruptResult, SnapshotProvider, TaskSnapshot,
    },
};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
