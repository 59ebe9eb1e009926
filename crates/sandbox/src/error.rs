use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("sandbox is disabled")]
    Disabled,

    #[error("sandbox is not running")]
    NotRunning,

    #[error("sandbox did not become ready within {after_ms}ms")]
    StartupTimeout { after_ms: u64 },

    #[error(transparent)]
    Runtime(#[from] warden_container::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl warden_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

warden_common::impl_context!();
