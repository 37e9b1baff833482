use thiserror::Error;

/// Errors raised by the optimizer.
#[derive(Error, Debug)]
pub enum SophiaError {
    /// Bad hyper-parameter or group layout, raised at construction or reconfiguration.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Gradient representation the update rule cannot consume.
    #[error("Invalid gradient for parameter {param}: {reason}")]
    InvalidGradient { param: usize, reason: String },

    /// Capturable mode found a tensor off the shared accelerator device.
    #[error("Device placement error for parameter {param}: {reason}")]
    DevicePlacement { param: usize, reason: String },

    /// A group references a parameter index outside the supplied slice.
    #[error("Unknown parameter {param} (only {available} supplied)")]
    UnknownParameter { param: usize, available: usize },

    #[error("Shape mismatch for parameter {param}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        param: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Persisted state does not fit this optimizer.
    #[error("State dict error: {0}")]
    StateDict(String),

    /// Loss closure failed.
    #[error("Closure error: {0}")]
    Closure(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SophiaError>;
