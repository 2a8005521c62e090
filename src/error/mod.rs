//! Unified error handling for Provis Core

use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
///
/// The taxonomy is deliberately small: callers branch on the variant, never
/// on message contents. `AuthFailed` carries a reason string for logs but a
/// caller must not be able to tell which stage of authentication rejected
/// the attempt.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("No such {kind}: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Multiple entries matched {key}: {}", paths.join(", "))]
    MultipleMatched { key: String, paths: Vec<String> },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Password policy violation: {0}")]
    PolicyViolation(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for a typed "no such X" failure
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        AppError::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Shorthand for an authentication failure with a diagnostic reason
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        AppError::AuthFailed {
            reason: reason.into(),
        }
    }

    /// True for failures a higher layer may retry (transient directory I/O)
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Directory(_))
    }
}

// Conversion from validation errors
impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(errors.to_string())
    }
}

impl From<ldap3::LdapError> for AppError {
    fn from(err: ldap3::LdapError) -> Self {
        AppError::Directory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::not_found("account", "user@example.com");
        assert_eq!(err.to_string(), "No such account: user@example.com");
    }

    #[test]
    fn test_multiple_matched_lists_paths() {
        let err = AppError::MultipleMatched {
            key: "dup@example.com".to_string(),
            paths: vec![
                "uid=dup,ou=people,dc=example,dc=com".to_string(),
                "uid=dup2,ou=people,dc=example,dc=com".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("dup@example.com"));
        assert!(msg.contains("uid=dup,ou=people"));
        assert!(msg.contains("uid=dup2,ou=people"));
    }

    #[test]
    fn test_error_conversion() {
        let err: AppError = anyhow::anyhow!("Something went wrong").into();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::Directory("connection reset".to_string()).is_transient());
        assert!(!AppError::auth_failed("bad credentials").is_transient());
    }
}
