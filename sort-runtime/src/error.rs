use crate::backend::DeviceLimit;

/// Failures reported by a [`DeviceBackend`](crate::DeviceBackend).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no GPU device found")]
    DeviceNotFound,
    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),
    #[error("kernel '{0}' not found in library")]
    KernelNotFound(String),
    #[error("device limit {0} unavailable")]
    LimitUnavailable(DeviceLimit),
    #[error("buffer allocation failed: {label} ({bytes} bytes)")]
    Allocation { label: String, bytes: usize },
    #[error("invalid launch of '{kernel}': {reason}")]
    InvalidLaunch { kernel: String, reason: String },
    #[error("GPU execution failed: {0}")]
    GpuExecution(String),
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

impl BackendError {
    pub(crate) fn invalid_launch(kernel: &str, reason: impl Into<String>) -> Self {
        BackendError::InvalidLaunch {
            kernel: kernel.to_string(),
            reason: reason.into(),
        }
    }
}
