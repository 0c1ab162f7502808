use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] remex_core::errors::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to execute command '{command}': {source}")]
    CommandFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("Command '{command}' exited with status {code}.\n--- STDERR ---\n{stderr}")]
    CommandExited {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Scratch payload '{0}' does not exist.")]
    ScratchMissing(String),

    #[error("Failed to build code package: {0}")]
    Package(String),

    #[error("Unexpected response from {backend}: {reason}")]
    Protocol { backend: String, reason: String },
}

pub type Result<T> = std::result::Result<T, BackendError>;
