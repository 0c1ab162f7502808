use crate::constants::reasons;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    General(String),

    #[error("Missing required configuration key '{0}'.")]
    MissingKey(&'static str),
}

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Task '{0}' is not a script task and has no command template.")]
    NotAScript(String),

    #[error("Script task '{task}' references argument '{name}' which was not supplied.")]
    MissingArgument { task: String, name: String },

    #[error("Invalid command template for script task '{task}': {reason}")]
    InvalidTemplate { task: String, reason: String },
}

/// Per-job failure reported to the scheduler. None of these stop the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Remote job failed: {reason}")]
    RemoteFailure { reason: String },

    #[error("{reason}")]
    Timeout { reason: String },

    #[error("Remote job succeeded but no output was found at '{location}'.")]
    MissingOutput { location: String },

    #[error("Task raised an error: {error}")]
    Task { error: String },

    #[error("Script failed:\n{stderr}")]
    Script { stderr: String },
}

impl JobError {
    pub fn timeout() -> Self {
        JobError::Timeout {
            reason: reasons::JOB_TIMEOUT.to_string(),
        }
    }

    /// Timeouts are a failure subtype the scheduler may retry differently.
    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout { .. })
    }

    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            JobError::RemoteFailure { .. } | JobError::Timeout { .. }
        )
    }
}

/// Traceback attached to a rejected job: task-side frames (when the task
/// recorded them) and the tail of the remote logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traceback {
    #[serde(default)]
    pub frames: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl Traceback {
    pub fn from_error(error: &JobError) -> Self {
        Self {
            frames: vec![error.to_string()],
            logs: Vec::new(),
        }
    }
}
