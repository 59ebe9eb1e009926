use {thiserror::Error, warden_protocol::RpcError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    /// The container runtime failed or is unreachable.
    #[error("container runtime error: {message}")]
    Runtime { message: String },

    #[error("busy: group {group} already has an agent run in flight")]
    Busy { group: String },

    #[error("mount rejected: {reason}")]
    MountRejected { reason: String },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("agent run interrupted")]
    Interrupted,

    #[error("rpc channel closed")]
    ChannelClosed,

    #[error("agent returned error {0}")]
    Rpc(RpcError),

    #[error("unknown group: {folder}")]
    UnknownGroup { folder: String },

    #[error("invalid group folder {folder:?}: {reason}")]
    InvalidFolder { folder: String, reason: String },

    #[error(transparent)]
    Frame(#[from] warden_protocol::FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl warden_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

warden_common::impl_context!();
