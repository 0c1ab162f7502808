use thiserror::Error;

/// Misuse of the submission API. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionConfigError {
    #[error("Cannot submit job '{0}': the engine has been stopped.")]
    EngineStopped(String),

    #[error("Script task '{0}' cannot be submitted as part of an array.")]
    ScriptArray(String),

    #[error("Array jobs must share one task, got '{first}' and '{other}'.")]
    MixedArray { first: String, other: String },

    #[error("Cannot build an array job from an empty batch.")]
    EmptyArray,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    SubmissionConfig(#[from] SubmissionConfigError),

    #[error(transparent)]
    Backend(#[from] remex_executor::BackendError),

    #[error(transparent)]
    Config(#[from] remex_core::errors::ConfigError),

    #[error(transparent)]
    Domain(#[from] remex_core::errors::DomainError),

    #[error("Failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine failure: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Errors that invalidate the engine setup rather than a single job.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::SubmissionConfig(_) | EngineError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
