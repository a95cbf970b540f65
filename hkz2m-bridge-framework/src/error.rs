//! Errors raised by the bus and the connection supervisor.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures of the bus and of bridge startup.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No configuration at {path}")]
    ConfigNotFound { path: String },

    #[error("Cannot parse configuration: {0}")]
    ConfigParse(String),

    #[error("Configuration rejected: {0}")]
    ConfigValidation(String),

    /// The broker rejected the request, or it never left the client.
    #[error("Failed to {op} {topic}: {message}")]
    Bus {
        op: &'static str,
        topic: String,
        message: String,
    },

    /// The connection dropped before the broker acknowledged.
    #[error("Connection lost before {op} {topic} was acknowledged")]
    ConnectionLost { op: &'static str, topic: String },

    #[error("Bus closed")]
    BusClosed,

    #[error("Cannot encode or decode payload: {0}")]
    Serialization(String),

    /// A task the runner depends on went away.
    #[error("Worker stopped: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Error for a bus operation `op` (publish, subscribe, ...) on `topic`.
    pub fn bus(op: &'static str, topic: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bus {
            op,
            topic: topic.into(),
            message: msg.into(),
        }
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Whether the error only reflects a dropped connection, which the
    /// next reconnect repairs.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}

impl From<hkz2m_common::Error> for BridgeError {
    fn from(err: hkz2m_common::Error) -> Self {
        match err {
            hkz2m_common::Error::Io(e) => Self::Io(e),
            hkz2m_common::Error::Json(e) => Self::Serialization(e.to_string()),
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for BridgeError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}
