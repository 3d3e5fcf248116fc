use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("failed to open event log {path}: {source}")]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write event log: {0}")]
    SinkWrite(#[source] io::Error),

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// A failed poll of the OS socket table. Recoverable: the tick is skipped.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("socket table query failed: {0}")]
    Query(String),

    #[error("socket table task failed: {0}")]
    Task(String),
}
