//! Fleet error types.

use thiserror::Error;

/// Errors that can occur during emulator fleet operations.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("emulator not found: {0}")]
    NotFound(String),

    #[error("no available adb ports in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid fleet config: {0}")]
    Config(String),

    #[error("container engine error: {0}")]
    Engine(#[from] anyhow::Error),
}

pub type EmulatorResult<T> = Result<T, EmulatorError>;

impl EmulatorError {
    /// Whether this error means the target emulator simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EmulatorError::NotFound(_))
    }
}
