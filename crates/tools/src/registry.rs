use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::Value,
    tracing::{debug, info, warn},
    warden_common::{IpcContext, ToolOutput},
    warden_container::RequestHandler,
    warden_protocol::{RpcError, ToolCallParams, error_codes, methods},
};

/// Host-side tool callable from inside an agent container.
///
/// `execute` errors are reported back to the agent as an `isError` result,
/// never as an RPC failure.
#[async_trait]
pub trait HostTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, ctx: &IpcContext, args: Value) -> Result<ToolOutput>;
}

/// Tools reachable over `tool.call`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn HostTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl HostTool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn HostTool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Sorted tool names.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_schemas(&self) -> Vec<Value> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }

    /// Run one tool on behalf of `ctx`. Never fails; problems become `isError` output.
    pub async fn call(&self, ctx: &IpcContext, name: &str, args: Value) -> ToolOutput {
        let Some(tool) = self.tools.get(name) else {
            debug!(tool = name, group = %ctx.group_folder, "unknown tool requested");
            return ToolOutput::error(format!("unknown tool: {name}"));
        };
        match tool.execute(ctx, args).await {
            Ok(output) => {
                info!(
                    tool = name,
                    group = %ctx.group_folder,
                    is_error = output.is_error,
                    "tool call finished"
                );
                output
            },
            Err(e) => {
                warn!(tool = name, group = %ctx.group_folder, error = %e, "tool call failed");
                ToolOutput::error(e.to_string())
            },
        }
    }
}

#[async_trait]
impl RequestHandler for ToolRegistry {
    async fn handle(
        &self,
        ctx: &IpcContext,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        if method != methods::TOOL_CALL {
            return Err(RpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("unsupported method: {method}"),
            ));
        }
        let call: ToolCallParams = serde_json::from_value(params)
            .map_err(|e| RpcError::new(error_codes::INVALID_PARAMS, e.to_string()))?;
        let args = if call.args.is_null() {
            Value::Object(Default::default())
        } else {
            call.args
        };
        let output = self.call(ctx, &call.name, args).await;
        serde_json::to_value(output).map_err(|e| RpcError::new(error_codes::INTERNAL, e.to_string()))
    }
}

// ── Argument helpers ─────────────────────────────────────────────────────────

/// Required, non-blank string argument.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing '{key}' parameter"))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Pretty JSON for tool content.
pub(crate) fn json_content(value: &impl serde::Serialize) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
