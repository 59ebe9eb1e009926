use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    warden_common::{ContainerMode, Provider},
    warden_mounts::MountSpec,
    warden_protocol::{AgentRunResult, Event, RunStatus, methods},
};

use crate::group::Group;

/// One agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    pub is_scheduled_task: bool,
    pub assistant_name: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub enable_thinking: bool,
    /// Extra mounts requested for this run, validated like the group's own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,
}

impl ContainerInput {
    /// Input pre-filled from the group's configuration.
    pub fn for_group(group: &Group, prompt: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            group_folder: group.folder.clone(),
            chat_jid: group.chat_jid.clone(),
            is_main: group.is_main,
            is_scheduled_task: false,
            assistant_name: assistant_name.into(),
            provider: group.provider,
            model: group.model.clone(),
            enable_thinking: false,
            mounts: Vec::new(),
        }
    }
}

/// Terminal result of [`run_agent`](crate::ContainerManager::run_agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Rejected because the group already had a run in flight; nothing ran.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub busy: bool,
}

impl ContainerOutput {
    pub fn success(result: Option<String>) -> Self {
        Self {
            status: RunStatus::Success,
            result,
            error: None,
            busy: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            result: None,
            error: Some(message.into()),
            busy: false,
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self {
            busy: true,
            ..Self::error(message)
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

impl From<AgentRunResult> for ContainerOutput {
    fn from(r: AgentRunResult) -> Self {
        Self {
            status: r.status,
            result: r.result,
            error: r.error,
            busy: false,
        }
    }
}

/// Streamed progress from the agent while a run is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Delta(String),
    Thinking(String),
    ToolProgress(serde_json::Value),
    Other {
        method: String,
        params: serde_json::Value,
    },
}

impl From<Event> for AgentEvent {
    fn from(event: Event) -> Self {
        let text = || {
            event
                .params
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string()
        };
        match event.method.as_str() {
            methods::AGENT_DELTA => Self::Delta(text()),
            methods::AGENT_THINKING => Self::Thinking(text()),
            methods::AGENT_TOOL_PROGRESS => Self::ToolProgress(event.params.clone()),
            _ => Self::Other {
                method: event.method.clone(),
                params: event.params.clone(),
            },
        }
    }
}

pub trait AgentCallbacks: Send + Sync {
    fn on_event(&self, group_folder: &str, event: &AgentEvent);
}

/// Reply to an interrupt request; always definite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptResult {
    pub interrupted: bool,
    pub message: String,
}

/// Row of [`status`](crate::ContainerManager::status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleStatus {
    pub group: String,
    /// `None` while a container is being started or torn down.
    pub container: Option<String>,
    pub mode: Option<ContainerMode>,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub busy: bool,
    pub interrupted: bool,
}

/// Task row written to `current_tasks.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub status: String,
    pub next_run: Option<u64>,
}

/// Group row written to `available_groups.json` (main group only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub folder: String,
    pub name: String,
    pub chat_jid: String,
    pub active: bool,
}

impl From<&Group> for GroupSnapshot {
    fn from(g: &Group) -> Self {
        Self {
            folder: g.folder.clone(),
            name: g.name.clone(),
            chat_jid: g.chat_jid.clone(),
            active: g.active,
        }
    }
}

/// Source of the task list copied into each group's IPC directory.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn tasks(&self) -> Vec<TaskSnapshot>;
}
