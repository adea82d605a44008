pub mod circuit_breaker;

pub use circuit_breaker::*;

/// Errors raised by the engine's own machinery.
///
/// Failures of caller-supplied fetch functions never end up here; they are
/// surfaced unchanged through [`CircuitBreakerError::OperationFailed`].
#[derive(Debug, thiserror::Error)]
pub enum OptimizationError {
    /// Invalid size/threshold configuration, detected at construction time.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to load configuration from {source_name}: {message}")]
    ConfigLoad { source_name: String, message: String },
    #[error("{codec} codec failed: {message}")]
    Codec { codec: &'static str, message: String },
    #[error("metrics export failed: {0}")]
    MetricsExport(String),
}

impl OptimizationError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn codec(codec: &'static str, message: impl ToString) -> Self {
        Self::Codec {
            codec,
            message: message.to_string(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::ConfigLoad { .. })
    }
}
