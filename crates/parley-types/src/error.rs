use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    DuplicateEmail,
    InvalidCredentials,
    InvalidArgument,
    Transient,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::DuplicateEmail => "duplicate_email",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidArgument => "invalid_argument",
            Self::Transient => "transient",
            Self::Internal => "internal",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Email is already registered")]
    DuplicateEmail,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Safe to retry with backoff.
    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateEmail => ErrorKind::DuplicateEmail,
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show to a client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_details_are_hidden() {
        let err = ChatError::Internal("disk exploded at /var/lib".into());
        assert_eq!(err.public_message(), "internal error");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DuplicateEmail).unwrap();
        assert_eq!(json, "\"duplicate_email\"");
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
    }
}
