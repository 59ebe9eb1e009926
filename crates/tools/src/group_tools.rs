//! Group administration and mount requests.

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::Deserialize,
    serde_json::{Value, json},
    warden_common::{ContainerMode, IpcContext, Provider, ToolOutput},
    warden_container::{Group, GroupRegistry},
    warden_mounts::{AllowlistCache, MountSpec},
};

use crate::registry::{HostTool, json_content, require_str};

// ── register_group ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterArgs {
    folder: String,
    name: String,
    chat_jid: String,
    #[serde(default)]
    trigger: String,
    #[serde(default)]
    container_mode: ContainerMode,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

pub struct RegisterGroupTool {
    groups: Arc<GroupRegistry>,
}

impl RegisterGroupTool {
    pub fn new(groups: Arc<GroupRegistry>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl HostTool for RegisterGroupTool {
    fn name(&self) -> &str {
        "register_group"
    }

    fn description(&self) -> &str {
        "Register a chat as a new group (main group only). \
         The folder becomes the group's workspace directory name."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "folder": { "type": "string", "description": "Letters, digits, '-' and '_' only" },
                "name": { "type": "string" },
                "chat_jid": { "type": "string" },
                "trigger": { "type": "string", "description": "Word that wakes the assistant" },
                "container_mode": { "type": "string", "enum": ["persistent", "one-shot"] },
                "provider": { "type": "string", "enum": ["anthropic", "openai", "openrouter", "ollama", "gemini"] },
                "model": { "type": "string" }
            },
            "required": ["folder", "name", "chat_jid"]
        })
    }

    async fn execute(&self, ctx: &IpcContext, args: Value) -> Result<ToolOutput> {
        if !ctx.is_main {
            return Ok(ToolOutput::error("only the main group can register groups"));
        }
        let args: RegisterArgs = serde_json::from_value(args)
            .map_err(|e| anyhow::anyhow!("invalid register_group arguments: {e}"))?;

        let mut group = Group::new(args.folder, args.name, args.chat_jid);
        group.trigger = args.trigger;
        group.container_mode = args.container_mode;
        group.model = args.model;
        if let Some(provider) = args.provider {
            group.provider = provider.parse::<Provider>()?;
        }
        // Mounts and the main flag are kept from an existing registration.
        if let Some(existing) = self.groups.get(&group.folder).await {
            group.is_main = existing.is_main;
            group.additional_mounts = existing.additional_mounts;
            group.timeout_ms = existing.timeout_ms;
        }

        let group = self.groups.register(group).await?;
        Ok(ToolOutput::ok(format!(
            "group {} registered for {}",
            group.folder, group.chat_jid
        )))
    }
}

// ── request_mount ────────────────────────────────────────────────────────────

pub struct RequestMountTool {
    allowlist: Arc<AllowlistCache>,
    groups: Arc<GroupRegistry>,
}

impl RequestMountTool {
    pub fn new(allowlist: Arc<AllowlistCache>, groups: Arc<GroupRegistry>) -> Self {
        Self { allowlist, groups }
    }
}

#[async_trait]
impl HostTool for RequestMountTool {
    fn name(&self) -> &str {
        "request_mount"
    }

    fn description(&self) -> &str {
        "Ask for a host directory to be mounted into this group's container under \
         /workspace/extra/<container_path>. Approved mounts apply from the next container start."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "host_path": { "type": "string" },
                "container_path": { "type": "string", "description": "Relative path under /workspace/extra" },
                "allow_read_write": { "type": "boolean", "default": false }
            },
            "required": ["host_path", "container_path"]
        })
    }

    async fn execute(&self, ctx: &IpcContext, args: Value) -> Result<ToolOutput> {
        let spec = MountSpec {
            host_path: require_str(&args, "host_path")?.to_string(),
            container_path: args
                .get("container_path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            allow_read_write: args
                .get("allow_read_write")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        let decision = self.allowlist.validate(&spec, ctx.is_main);
        let Some(effective) = decision.effective.filter(|_| decision.allowed) else {
            return Ok(ToolOutput::error(format!(
                "mount rejected: {}",
                decision.reason
            )));
        };

        if let Some(mut group) = self.groups.get(&ctx.group_folder).await {
            group
                .additional_mounts
                .retain(|m| m.container_path.trim() != spec.container_path.trim());
            group.additional_mounts.push(spec);
            self.groups.register(group).await?;
        }

        Ok(ToolOutput::ok(json_content(&json!({
            "hostPath": effective.host_path,
            "containerPath": effective.container_path,
            "readOnly": effective.read_only,
            "reason": decision.reason,
        }))?))
    }
}
