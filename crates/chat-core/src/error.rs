//! Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors raised synchronously by the dispatcher and by providers
#[derive(Error, Debug)]
pub enum ChatError {
    /// A declared function could not be converted to a provider declaration
    #[error("Schema conversion failed for '{function}': {reason}")]
    SchemaConversion { function: String, reason: String },

    /// Two functions share a name within one registry
    #[error("Function already declared: {0}")]
    DuplicateFunction(String),

    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The token stream broke off before completion
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// A provider chunk that could not be decoded
    #[error("Malformed provider event: {0}")]
    MalformedEvent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::ProviderUnavailable(_) | ChatError::RateLimited(_) | ChatError::Io(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            ChatError::SchemaConversion { function, .. } => {
                format!("The function '{}' is declared incorrectly.", function)
            }
            ChatError::Provider(msg) => format!("The AI service encountered an error: {}", msg),
            ChatError::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            ChatError::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            ChatError::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            ChatError::StreamInterrupted(_) => "The response was cut off. Please try again.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

/// Errors delivered to subscribers while an invocation is running.
///
/// These travel through the event channel, so they carry owned strings
/// instead of source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The stream could not be opened, even after retrying
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The stream broke off; any partial text is finalised after this error
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// No chunk arrived within the idle timeout
    #[error("No chunk received for {0:?}")]
    TimedOut(Duration),

    /// A provider event that could not be interpreted
    #[error("Malformed provider event: {0}")]
    MalformedEvent(String),

    /// The model called a function that was never declared
    #[error("Unregistered function call: {0}")]
    UnregisteredFunction(String),

    /// Call arguments do not satisfy the declared parameter schema
    #[error("Invalid arguments for '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },
}

impl From<ChatError> for DispatchError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::ProviderUnavailable(msg) | ChatError::RateLimited(msg) => {
                DispatchError::ProviderUnavailable(msg)
            }
            ChatError::MalformedEvent(msg) => DispatchError::MalformedEvent(msg),
            ChatError::StreamInterrupted(msg) => DispatchError::StreamInterrupted(msg),
            other => DispatchError::StreamInterrupted(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ChatError::ProviderUnavailable("down".into()).is_retryable());
        assert!(ChatError::RateLimited("slow down".into()).is_retryable());
        assert!(!ChatError::Auth("bad key".into()).is_retryable());
        assert!(!ChatError::MalformedEvent("garbage".into()).is_retryable());
    }

    #[test]
    fn test_dispatch_error_conversion() {
        let err: DispatchError = ChatError::MalformedEvent("bad json".into()).into();
        assert_eq!(err, DispatchError::MalformedEvent("bad json".into()));

        let err: DispatchError = ChatError::Provider("boom".into()).into();
        assert!(matches!(err, DispatchError::StreamInterrupted(_)));
    }
}
