//! Host-side tools that agents inside containers reach over `tool.call`.
//!
//! Every call carries the caller's [`IpcContext`](warden_common::IpcContext).
//! Non-main groups act only on their own tasks and chat; the main group may
//! target any group and is the only one allowed to register groups.

pub mod group_tools;
pub mod message;
pub mod registry;
pub mod sandbox_tools;
pub mod task_tools;

use std::sync::Arc;

use {
    warden_container::GroupRegistry,
    warden_cron::TaskScheduler,
    warden_mounts::AllowlistCache,
};

pub use {
    group_tools::{RegisterGroupTool, RequestMountTool},
    message::{MessageSink, OutboxEntry, OutboxSink, SendMessageTool},
    registry::{HostTool, ToolRegistry},
    sandbox_tools::{SandboxAcquireTool, SandboxLeases, SandboxReleaseTool},
    task_tools::{ListTasksTool, ScheduleTaskTool, StoreSnapshots, TaskStatusTool},
};

/// Collaborators the built-in tools need.
pub struct HostServices {
    pub scheduler: Arc<TaskScheduler>,
    pub groups: Arc<GroupRegistry>,
    pub allowlist: Arc<AllowlistCache>,
    pub sink: Arc<dyn MessageSink>,
    /// `None` leaves the sandbox tools out.
    pub sandbox: Option<Arc<SandboxLeases>>,
}

/// Registry with every built-in tool.
pub fn host_tools(services: HostServices) -> ToolRegistry {
    let HostServices {
        scheduler,
        groups,
        allowlist,
        sink,
        sandbox,
    } = services;

    let mut registry = ToolRegistry::new();
    registry.register(ScheduleTaskTool::new(
        Arc::clone(&scheduler),
        Arc::clone(&groups),
    ));
    registry.register(ListTasksTool::new(Arc::clone(scheduler.store())));
    registry.register(TaskStatusTool::pause(Arc::clone(&scheduler)));
    registry.register(TaskStatusTool::resume(Arc::clone(&scheduler)));
    registry.register(TaskStatusTool::cancel(scheduler));
    registry.register(SendMessageTool::new(sink));
    registry.register(RegisterGroupTool::new(Arc::clone(&groups)));
    registry.register(RequestMountTool::new(allowlist, groups));
    if let Some(leases) = sandbox {
        registry.register(SandboxAcquireTool::new(Arc::clone(&leases)));
        registry.register(SandboxReleaseTool::new(leases));
    }
    registry
}
