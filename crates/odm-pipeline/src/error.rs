//! Pipeline error taxonomy
//!
//! Extract, stage and package failures abort a run and fail its execution.
//! Load and notification failures are recorded and the run carries on.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Upper bound on the text persisted in `executions.error_message`
pub const MAX_ERROR_MESSAGE_LEN: usize = 4000;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or invalid parameter, raised before any I/O
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// HTTP failure, including client timeouts
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("Format error: {0}")]
    Format(String),

    #[error("Unknown fetcher type: {0}")]
    UnknownFetcherType(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Next version number does not fit
    #[error("Version error: {0}")]
    Version(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource not found: {0}")]
    ResourceNotFound(Uuid),

    #[error("Resource {0} already has a run in progress")]
    AlreadyRunning(Uuid),

    #[error("Transport error: extract did not finish within {seconds}s")]
    Timeout { seconds: u64 },
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        PipelineError::Transport(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        PipelineError::Format(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        PipelineError::Catalog(msg.into())
    }

    /// Taxonomy name used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "ConfigurationError",
            PipelineError::Transport(_) | PipelineError::Timeout { .. } => "TransportError",
            PipelineError::Format(_) => "FormatError",
            PipelineError::UnknownFetcherType(_) => "UnknownFetcherType",
            PipelineError::Load(_) => "LoadError",
            PipelineError::Notification(_) => "NotificationError",
            PipelineError::Catalog(_) => "CatalogError",
            PipelineError::Version(_) => "VersionError",
            PipelineError::Io(_) => "IoError",
            PipelineError::ResourceNotFound(_) => "ResourceNotFound",
            PipelineError::AlreadyRunning(_) => "AlreadyRunning",
        }
    }

    /// Text stored on the execution record for operators
    pub fn phase_message(&self) -> String {
        truncate_message(&self.to_string(), MAX_ERROR_MESSAGE_LEN)
    }
}

/// Cut `message` to at most `max` bytes on a char boundary
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PipelineError::Format(err.to_string())
        } else {
            PipelineError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            PipelineError::Io(err.into())
        } else {
            PipelineError::Format(err.to_string())
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Catalog(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for PipelineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        PipelineError::Catalog(format!("migration failed: {}", err))
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Format(err.to_string())
    }
}

impl From<regex::Error> for PipelineError {
    fn from(err: regex::Error) -> Self {
        PipelineError::Configuration(format!("invalid pattern: {}", err))
    }
}

impl From<url::ParseError> for PipelineError {
    fn from(err: url::ParseError) -> Self {
        PipelineError::Configuration(format!("invalid url: {}", err))
    }
}

impl From<odm_common::CommonError> for PipelineError {
    fn from(err: odm_common::CommonError) -> Self {
        match err {
            odm_common::CommonError::Io(e) => PipelineError::Io(e),
            odm_common::CommonError::Serialization(e) => PipelineError::Format(e.to_string()),
            odm_common::CommonError::Config(msg) => PipelineError::Configuration(msg),
            other => PipelineError::Format(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_taxonomy() {
        assert_eq!(PipelineError::configuration("url").kind(), "ConfigurationError");
        assert_eq!(PipelineError::Timeout { seconds: 5 }.kind(), "TransportError");
        assert_eq!(PipelineError::Load("x".into()).kind(), "LoadError");
    }

    #[test]
    fn test_phase_message_is_bounded() {
        let err = PipelineError::transport("é".repeat(MAX_ERROR_MESSAGE_LEN));
        let message = err.phase_message();
        assert!(message.len() <= MAX_ERROR_MESSAGE_LEN);
        assert!(message.starts_with("Transport error: "));
    }

    #[test]
    fn test_json_error_is_format_error() {
        let err: PipelineError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, PipelineError::Format(_)));
    }
}
