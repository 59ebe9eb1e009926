//! Desktop sandbox leases for agents.
//!
//! Each group holds at most one lease. Leases outlive the tool call and are
//! dropped on `sandbox_release` or when [`SandboxLeases::release_all`] runs at
//! shutdown.

use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::info,
    warden_common::{IpcContext, ToolOutput},
    warden_sandbox::{SandboxLease, SandboxManager},
};

use crate::registry::{HostTool, json_content};

/// Leases currently held, keyed by group folder.
pub struct SandboxLeases {
    sandbox: Arc<SandboxManager>,
    held: Mutex<HashMap<String, SandboxLease>>,
}

impl SandboxLeases {
    pub fn new(sandbox: Arc<SandboxManager>) -> Arc<Self> {
        Arc::new(Self {
            sandbox,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub async fn holders(&self) -> Vec<String> {
        let mut holders: Vec<String> = self.held.lock().await.keys().cloned().collect();
        holders.sort();
        holders
    }

    /// Take a lease for `group` unless it already holds one.
    pub async fn acquire(&self, group: &str) -> warden_sandbox::Result<()> {
        let mut held = self.held.lock().await;
        if held.contains_key(group) {
            self.sandbox.touch();
            self.sandbox.ensure().await?;
            return Ok(());
        }
        let lease = self.sandbox.acquire().await?;
        held.insert(group.to_string(), lease);
        info!(group, "sandbox lease taken");
        Ok(())
    }

    /// Returns whether `group` held a lease.
    pub async fn release(&self, group: &str) -> bool {
        let lease = self.held.lock().await.remove(group);
        match lease {
            Some(lease) => {
                lease.release();
                info!(group, "sandbox lease returned");
                true
            },
            None => false,
        }
    }

    pub async fn release_all(&self) {
        let leases: Vec<SandboxLease> = self.held.lock().await.drain().map(|(_, l)| l).collect();
        drop(leases);
    }
}

pub struct SandboxAcquireTool {
    leases: Arc<SandboxLeases>,
}

impl SandboxAcquireTool {
    pub fn new(leases: Arc<SandboxLeases>) -> Self {
        Self { leases }
    }
}

#[async_trait]
impl HostTool for SandboxAcquireTool {
    fn name(&self) -> &str {
        "sandbox_acquire"
    }

    fn description(&self) -> &str {
        "Start (or reuse) the shared desktop sandbox and get a live-view link a human can open \
         to watch or take over. Call sandbox_release when done."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, ctx: &IpcContext, _args: Value) -> Result<ToolOutput> {
        if let Err(e) = self.leases.acquire(&ctx.group_folder).await {
            return Ok(ToolOutput::error(format!("sandbox unavailable: {e}")));
        }
        let sandbox = &self.leases.sandbox;
        let status = sandbox.status();
        Ok(ToolOutput::ok(json_content(&json!({
            "liveViewUrl": sandbox.live_view_url(),
            "container": status.container,
            "leases": status.leases,
        }))?))
    }
}

pub struct SandboxReleaseTool {
    leases: Arc<SandboxLeases>,
}

impl SandboxReleaseTool {
    pub fn new(leases: Arc<SandboxLeases>) -> Self {
        Self { leases }
    }
}

#[async_trait]
impl HostTool for SandboxReleaseTool {
    fn name(&self) -> &str {
        "sandbox_release"
    }

    fn description(&self) -> &str {
        "Give back this group's desktop sandbox lease."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, ctx: &IpcContext, _args: Value) -> Result<ToolOutput> {
        if self.leases.release(&ctx.group_folder).await {
            Ok(ToolOutput::ok("Sandbox released."))
        } else {
            Ok(ToolOutput::ok("No sandbox lease was held."))
        }
    }
}
