// ABOUTME: Error taxonomy for the Backend contract
// ABOUTME: Shared by FilesystemBackend and any future remote-object-store backend

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Free-form diagnostic context attached to every [`BackendError`].
pub type ErrorContext = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object not found: {key}")]
    NotFound { key: String, context: ErrorContext },

    #[error("version conflict on {key}: expected {expected}, observed {observed}")]
    Conflict {
        key: String,
        expected: String,
        observed: String,
        context: ErrorContext,
    },

    #[error("invalid data: {reason}")]
    InvalidData { reason: String, context: ErrorContext },

    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String, context: ErrorContext },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration, ErrorContext),

    #[error("storage transport error: {0}")]
    Transport(String, ErrorContext),

    #[error("storage quota exceeded: {reason}")]
    QuotaExceeded { reason: String, context: ErrorContext },
}

impl BackendError {
    pub fn not_found(key: impl Into<String>) -> Self {
        BackendError::NotFound {
            key: key.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn invalid_data(reason: impl Into<String>) -> Self {
        BackendError::InvalidData {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        BackendError::Transport(reason.into(), ErrorContext::new())
    }

    /// Attach a diagnostic field, builder-style.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let ctx = match &mut self {
            BackendError::NotFound { context, .. }
            | BackendError::InvalidData { context, .. }
            | BackendError::Unauthorized { context, .. }
            | BackendError::QuotaExceeded { context, .. }
            | BackendError::Conflict { context, .. } => context,
            BackendError::Timeout(_, context) | BackendError::Transport(_, context) => context,
        };
        ctx.insert(key.into(), value.into());
        self
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict { .. })
    }
}

/// Maps raw `io::Error`s from the filesystem backend into the taxonomy above.
impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => BackendError::NotFound {
                key: String::new(),
                context: ErrorContext::new(),
            },
            ErrorKind::PermissionDenied => BackendError::Unauthorized {
                reason: err.to_string(),
                context: ErrorContext::new(),
            },
            _ => BackendError::Transport(err.to_string(), ErrorContext::new()),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
