use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Unreadable, unparsable or invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Base topic or friendly name not usable as an MQTT topic.
    #[error("Invalid topic: {0}")]
    Topic(String),
}

pub type Result<T> = std::result::Result<T, Error>;
