//! Host ↔ agent-container RPC protocol.
//!
//! Newline-delimited JSON: every line is exactly one JSON object followed by
//! `\n`. Three message kinds share the `type` discriminator:
//! - `request`: `{type, id, method, params}`, answered by exactly one response
//! - `response`: `{type, id, result | error}`
//! - `event`: `{type, method, params}`, fire-and-forget, either direction
//!
//! This crate is pure framing and payload definitions; the async channel that
//! correlates requests lives in `warden-container`.

pub mod codec;
pub mod payload;

use serde::{Deserialize, Deserializer, Serialize};

pub use {
    codec::{FrameDecoder, FrameError, ParseOutput, encode, parse_chunk},
    payload::{AgentRunParams, AgentRunResult, RunStatus, ToolCallParams},
};

// ── Constants ────────────────────────────────────────────────────────────────

/// A peer that buffers more than this without a newline is considered broken.
pub const MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024; // 8 MB

// ── Method names ─────────────────────────────────────────────────────────────

pub mod methods {
    /// Host → container request: run one agent turn.
    pub const AGENT_RUN: &str = "agent.run";
    /// Host → container event: abandon the current turn.
    pub const AGENT_INTERRUPT: &str = "agent.interrupt";
    /// Host → container event: exit cleanly.
    pub const AGENT_SHUTDOWN: &str = "agent.shutdown";
    /// Container → host event: the agent loop is accepting requests.
    pub const AGENT_READY: &str = "agent.ready";
    /// Container → host event: streamed text delta.
    pub const AGENT_DELTA: &str = "agent.delta";
    /// Container → host event: streamed thinking text.
    pub const AGENT_THINKING: &str = "agent.thinking";
    /// Container → host event: tool progress update.
    pub const AGENT_TOOL_PROGRESS: &str = "agent.tool_progress";
    /// Container → host request: invoke a host-side tool.
    pub const TOOL_CALL: &str = "tool.call";
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const INTERNAL: &str = "INTERNAL";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERRUPTED: &str = "INTERRUPTED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const BUSY: &str = "BUSY";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// Discriminated union of all message kinds on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

/// A response carries `result` on success or `error` on failure.
///
/// `result: null` is kept distinct from an absent `result` so a parsed
/// response serializes back to the same fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub method: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl RpcMessage {
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn response_ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::Response(Response {
            id: id.into(),
            result: Some(result),
            error: None,
        })
    }

    pub fn response_err(id: impl Into<String>, error: RpcError) -> Self {
        Self::Response(Response {
            id: id.into(),
            result: None,
            error: Some(error),
        })
    }

    pub fn event(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self::Event(Event {
            method: method.into(),
            params,
        })
    }

    /// Correlation id, if the message kind has one.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Event(_) => None,
        }
    }
}

impl Response {
    /// Collapse into `Ok(result)` / `Err(error)`; a response with neither is `Ok(null)`.
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(v), None) => Ok(v),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}
