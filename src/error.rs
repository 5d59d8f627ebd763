// Typed errors with thiserror. Surface meaningful messages to JS.
// See DESIGN.md: error handling

use std::fmt;

use thiserror::Error;

/// Player error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    /// Researcher-supplied code failed to compile, threw, or returned the wrong shape.
    /// Fatal: aborts setup of the frame.
    #[error("Configuration error in {kind}: {message}")]
    Configuration { kind: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid study sequence: {0}")]
    InvalidSequence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Save failed: {0}")]
    Persistence(String),

    #[error("Recorder error: {0}")]
    Recorder(String),
}

impl PlayerError {
    pub fn configuration(kind: impl Into<String>, message: impl Into<String>) -> Self {
        PlayerError::Configuration {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlayerError::Configuration { .. }
                | PlayerError::InvalidConfig(_)
                | PlayerError::InvalidSequence(_)
        )
    }
}

impl From<serde_json::Error> for PlayerError {
    fn from(err: serde_json::Error) -> Self {
        PlayerError::Serialization(err.to_string())
    }
}

/// A soft schema problem. Logged, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub kind: String,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(kind: &str, field: &str, message: impl Into<String>) -> Self {
        ValidationIssue {
            kind: kind.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.kind, self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PlayerError::configuration("exp-lookit-text", "selectNextFrame returned a string");
        assert!(err.to_string().contains("exp-lookit-text"));
        assert!(err.to_string().contains("returned a string"));
        assert!(err.is_fatal());
    }

    #[test]
    fn persistence_is_not_fatal() {
        assert!(!PlayerError::Persistence("offline".into()).is_fatal());
        assert!(!PlayerError::Recorder("denied".into()).is_fatal());
    }

    #[test]
    fn serde_error_converts() {
        let err: PlayerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, PlayerError::Serialization(_)));
    }

    #[test]
    fn validation_issue_names_kind_and_field() {
        let issue = ValidationIssue::new("exp-video", "videoSrc", "required field is missing");
        assert_eq!(issue.to_string(), "exp-video.videoSrc: required field is missing");
    }
}
