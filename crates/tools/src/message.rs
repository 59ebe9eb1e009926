//! Outbound chat messages from agents.

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tokio::{io::AsyncWriteExt, sync::Mutex},
    tracing::info,
    warden_common::{IpcContext, ToolOutput},
};

use crate::registry::{HostTool, optional_str, require_str};

/// Delivers a message to a chat. Channel adapters implement this.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, chat_jid: &str, text: &str) -> Result<()>;
}

/// One line of the outbox file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub chat_jid: String,
    pub text: String,
    pub sent_at: u64,
}

/// Appends messages to a JSON-lines file for a channel bridge to pick up.
pub struct OutboxSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OutboxSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl MessageSink for OutboxSink {
    async fn send(&self, chat_jid: &str, text: &str) -> Result<()> {
        let entry = OutboxEntry {
            chat_jid: chat_jid.to_string(),
            text: text.to_string(),
            sent_at: warden_container::now_ms(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        info!(chat = chat_jid, chars = text.chars().count(), "message queued");
        Ok(())
    }
}

pub struct SendMessageTool {
    sink: Arc<dyn MessageSink>,
}

impl SendMessageTool {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl HostTool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to the group's chat right away, e.g. progress on a long task. \
         The main group may address another chat with chat_jid."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "chat_jid": { "type": "string", "description": "Target chat (main group only)" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, ctx: &IpcContext, args: Value) -> Result<ToolOutput> {
        let text = require_str(&args, "text")?;
        let chat_jid = optional_str(&args, "chat_jid").unwrap_or(ctx.chat_jid.as_str());
        if !ctx.is_main && chat_jid != ctx.chat_jid {
            return Ok(ToolOutput::error(
                "only the main group can message other chats",
            ));
        }
        self.sink.send(chat_jid, text).await?;
        Ok(ToolOutput::ok("Message sent."))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send(&self, chat_jid: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_jid.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn ctx(is_main: bool) -> IpcContext {
        IpcContext {
            chat_jid: "family@g.us".into(),
            group_folder: "family".into(),
            is_main,
        }
    }

    #[tokio::test]
    async fn defaults_to_callers_chat() {
        let sink = Arc::new(RecordingSink::default());
        let tool = SendMessageTool::new(sink.clone());
        let out = tool
            .execute(&ctx(false), json!({"text": "halfway there"}))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(*sink.sent.lock().unwrap(), vec![(
            "family@g.us".to_string(),
            "halfway there".to_string()
        )]);
    }

    #[tokio::test]
    async fn non_main_cannot_message_other_chats() {
        let sink = Arc::new(RecordingSink::default());
        let tool = SendMessageTool::new(sink.clone());
        let out = tool
            .execute(&ctx(false), json!({"text": "hi", "chat_jid": "work@g.us"}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(sink.sent.lock().unwrap().is_empty());

        let out = tool
            .execute(&ctx(true), json!({"text": "hi", "chat_jid": "work@g.us"}))
            .await
            .unwrap();
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn empty_text_fails() {
        let tool = SendMessageTool::new(Arc::new(RecordingSink::default()));
        assert!(tool.execute(&ctx(true), json!({"text": "  "})).await.is_err());
    }

    #[tokio::test]
    async fn outbox_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutboxSink::new(dir.path().join("nested/outbox.jsonl"));
        sink.send("a@g.us", "one").await.unwrap();
        sink.send("b@g.us", "two").await.unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let entries: Vec<OutboxEntry> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].chat_jid, "a@g.us");
        assert_eq!(entries[1].text, "two");
    }
}
