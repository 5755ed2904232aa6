use serde::Serialize;
use thiserror::Error;

/// Common error type for Halo with clear taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Load-time errors
    #[error("Model artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),

    #[error("Vocabulary load failed: {0}")]
    VocabLoad(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generation-time errors
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Runtime not ready")]
    RuntimeNotReady,

    #[error("Generation cancelled")]
    Cancelled,

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO and serialization errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic anyhow error for flexibility
    #[error("Error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Get error type for metrics/logging
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::ArtifactNotFound(_) => "artifact_not_found",
            Error::PermissionDenied(_) => "permission_denied",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::ModelLoad(_) => "model_load_error",
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::VocabLoad(_) => "vocab_load_error",
            Error::Configuration(_) => "configuration_error",
            Error::Generation(_) => "generation_error",
            Error::RuntimeNotReady => "runtime_not_ready",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Anyhow(_) => "unknown",
        }
    }

    /// Whether the failure happened while bringing a model up
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Error::ArtifactNotFound(_)
                | Error::PermissionDenied(_)
                | Error::InvalidArgument(_)
                | Error::ModelLoad(_)
                | Error::UnsupportedFormat(_)
                | Error::VocabLoad(_)
        )
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RuntimeNotReady | Error::Generation(_) | Error::Io(_))
    }
}

/// Serializable error summary, used when an error has to be shown or logged as data
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub r#type: String,
    pub retryable: bool,
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        ErrorReport {
            message: err.to_string(),
            r#type: err.error_type().to_string(),
            retryable: err.is_retryable(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
