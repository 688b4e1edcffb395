//! Error types for flogger-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FloggerError {
    /// Illegal reconfiguration, unknown pool kind, or a pool/store mismatch.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("log entry `{0}` is already declared")]
    DuplicateEntry(String),

    #[error("log entry `{0}` was never declared")]
    UnknownEntry(String),

    /// A single handler failed inside a push, dump or reset. Always logged and
    /// suppressed at the point of invocation.
    #[error("{logger} DataLogger: handler {handler} of {entry} failed: {cause}")]
    Handler {
        logger: String,
        entry: String,
        handler: String,
        cause: String,
    },

    /// A unit of work failed as a whole, outside of any single handler.
    #[error("unit of work failed: {0}")]
    Backend(String),

    #[error("worker protocol error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FloggerError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        FloggerError::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, FloggerError>;
