use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid driver workspace id: {0}")]
    InvalidId(String),

    #[error("No deployment workspace for {0}")]
    UnknownWorkspace(String),

    #[error("Failed to start command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {after:?}: {command}")]
    Timeout { command: String, after: Duration },

    #[error("Command failed: {command}\n\n{output}")]
    Command { command: String, output: String },

    #[error("Tool not found on PATH: {0}")]
    ToolMissing(String),

    #[error("Unexpected output format: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
