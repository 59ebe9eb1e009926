//! Typed `params`/`result` bodies for the well-known methods.

use serde::{Deserialize, Serialize};

/// `agent.run` request params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunParams {
    pub prompt: String,
    pub group_folder: String,
    pub chat_jid: String,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled_task: bool,
    pub assistant_name: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub enable_thinking: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Success,
    Error,
}

/// `agent.run` response result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResult {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `tool.call` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn run_params_are_camel_case() {
        let params = AgentRunParams {
            prompt: "summarise".into(),
            group_folder: "family".into(),
            chat_jid: "123@g.us".into(),
            is_scheduled_task: true,
            assistant_name: "Andy".into(),
            provider: "anthropic".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["groupFolder"], "family");
        assert_eq!(v["isScheduledTask"], true);
        assert!(v.get("model").is_none());
    }

    #[test]
    fn tool_call_args_default_to_null() {
        let p: ToolCallParams = serde_json::from_value(json!({"name": "list_tasks"})).unwrap();
        assert_eq!(p.name, "list_tasks");
        assert!(p.args.is_null());
    }

    #[test]
    fn run_result_error_shape() {
        let r: AgentRunResult =
            serde_json::from_value(json!({"status": "error", "error": "model refused"})).unwrap();
        assert_eq!(r.status, RunStatus::Error);
        assert_eq!(r.error.as_deref(), Some("model refused"));
        assert!(r.result.is_none());
    }
}
