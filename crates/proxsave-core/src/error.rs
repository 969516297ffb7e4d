use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RestoreError>;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("sandbox violation: {0}")]
    Sandbox(String),

    #[error("unsupported archive format: '{0}'")]
    UnsupportedArchive(String),

    #[error("invalid archive data: {0}")]
    InvalidArchive(String),

    #[error("parse error in {file}: {detail}")]
    Parse { file: String, detail: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("command '{command}' failed: {detail}")]
    Tool { command: String, detail: String },

    #[error("command '{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("failed to {action} service(s): {}", .services.join(", "))]
    Service {
        action: &'static str,
        services: Vec<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("aborted by user")]
    Aborted,

    #[error("firewall apply not committed")]
    FirewallNotCommitted(Box<FirewallNotCommitted>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Payload of the "firewall apply not committed" error. The armed dead-man
/// timer keeps running; the caller needs these paths to watch or cancel it.
#[derive(Debug, Clone)]
pub struct FirewallNotCommitted {
    pub rollback_armed: bool,
    pub marker_path: PathBuf,
    pub log_path: PathBuf,
    pub deadline: SystemTime,
}

impl RestoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreError::Cancelled)
    }
}
