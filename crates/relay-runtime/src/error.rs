//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime errors.
///
/// Everything that happens behind the [`Device`](relay_core::Device) trait is
/// reported as a [`relay_core::Error`]; this type adds the failures that only
/// occur while setting up or talking to wgpu directly.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// GPU initialization failed.
    #[error("GPU initialization failed: {0}")]
    InitError(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// Buffer async error.
    #[error("Buffer async error: {0}")]
    BufferAsyncError(#[from] wgpu::BufferAsyncError),

    #[error(transparent)]
    Relay(#[from] relay_core::Error),
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<RuntimeError> for relay_core::Error {
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::Relay(error) => error,
            other => relay_core::Error::Device(other.to_string()),
        }
    }
}
