//! Types shared between the orchestrator crates.

use serde::{Deserialize, Serialize};

/// Lifecycle discipline for a group's agent container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerMode {
    /// Kept alive between invocations until idle-reclaimed.
    #[default]
    Persistent,
    /// Created for one invocation and destroyed afterwards.
    OneShot,
}

impl ContainerMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::OneShot => "one-shot",
        }
    }
}

impl std::fmt::Display for ContainerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LLM backend the in-container agent should use.
///
/// Adapters live inside the agent image; the host only forwards the choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Anthropic,
    OpenAi,
    OpenRouter,
    Ollama,
    Gemini,
}

impl Provider {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "openrouter" => Ok(Self::OpenRouter),
            "ollama" => Ok(Self::Ollama),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(crate::Error::validation(format!("unknown provider: {other}"))),
        }
    }
}

/// Identity of the group on whose behalf a tool call arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcContext {
    pub chat_jid: String,
    pub group_folder: String,
    pub is_main: bool,
}

impl IpcContext {
    /// Whether this caller may act on resources owned by `group_folder`.
    #[must_use]
    pub fn may_target(&self, group_folder: &str) -> bool {
        self.is_main || self.group_folder == group_folder
    }
}

/// Result handed back to the container for a `tool.call` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Truncate to at most `max` characters, never splitting a code point.
#[must_use]
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("anthropic", Provider::Anthropic)]
    #[case("Claude", Provider::Anthropic)]
    #[case(" openai ", Provider::OpenAi)]
    #[case("google", Provider::Gemini)]
    fn provider_parses_aliases(#[case] input: &str, #[case] expected: Provider) {
        assert_eq!(input.parse::<Provider>().unwrap(), expected);
    }

    #[test]
    fn provider_rejects_unknown() {
        let err = "bard".parse::<Provider>().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn container_mode_serializes_kebab() {
        let json = serde_json::to_string(&ContainerMode::OneShot).unwrap();
        assert_eq!(json, "\"one-shot\"");
    }

    #[test]
    fn ipc_context_targeting() {
        let main = IpcContext {
            chat_jid: "main@g.us".into(),
            group_folder: "main".into(),
            is_main: true,
        };
        let other = IpcContext {
            chat_jid: "fam@g.us".into(),
            group_folder: "family".into(),
            is_main: false,
        };
        assert!(main.may_target("family"));
        assert!(other.may_target("family"));
        assert!(!other.may_target("work"));
    }

    #[test]
    fn tool_output_omits_false_error_flag() {
        let v = serde_json::to_value(ToolOutput::ok("done")).unwrap();
        assert!(v.get("isError").is_none());
        let v = serde_json::to_value(ToolOutput::error("nope")).unwrap();
        assert_eq!(v["isError"], true);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
