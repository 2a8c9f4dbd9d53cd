// ABOUTME: Error taxonomy for everything layered above docstore-backend
// ABOUTME: Wraps BackendError via #[from] the way a typed engine error wraps its storage collaborator

use docstore_backend::BackendError;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub type ErrorContext = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {key}")]
    NotFound { key: String, context: ErrorContext },

    #[error("already exists: {key}")]
    AlreadyExists { key: String, context: ErrorContext },

    #[error("conflict on {key}: expected {expected}, observed {observed}")]
    Conflict {
        key: String,
        expected: String,
        observed: String,
        context: ErrorContext,
    },

    #[error("constraint violation on {entity}.{field}={value}{}", existing_owner.as_deref().map(|o| format!(" (held by {o})")).unwrap_or_default())]
    ConstraintViolation {
        entity: String,
        field: String,
        value: String,
        existing_owner: Option<String>,
        context: ErrorContext,
    },

    #[error("invalid data: {reason}")]
    InvalidData { reason: String, context: ErrorContext },

    #[error("invalid config field {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
        context: ErrorContext,
    },

    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String, context: ErrorContext },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration, ErrorContext),

    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String, context: ErrorContext },

    #[error("lock held on {resource}")]
    LockHeld { resource: String, context: ErrorContext },

    #[error("lock acquisition on {resource} timed out")]
    LockTimeout { resource: String, context: ErrorContext },

    #[error("lock on {resource} was released out from under its holder")]
    LockReleased { resource: String, context: ErrorContext },

    #[error("index retries exhausted on {key} after {attempts} attempts")]
    IndexRetriesExhausted {
        key: String,
        attempts: u32,
        context: ErrorContext,
    },

    #[error("no migration path for {type_name} from v{from} to v{to}")]
    NoMigrationPath {
        type_name: String,
        from: i32,
        to: i32,
        context: ErrorContext,
    },

    #[error("storage quota exceeded: {reason}")]
    QuotaExceeded { reason: String, context: ErrorContext },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl EngineError {
    pub fn not_found(key: impl Into<String>) -> Self {
        EngineError::NotFound {
            key: key.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn invalid_data(reason: impl Into<String>) -> Self {
        EngineError::InvalidData {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn constraint_violation(
        entity: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
        existing_owner: Option<String>,
    ) -> Self {
        EngineError::ConstraintViolation {
            entity: entity.into(),
            field: field.into(),
            value: value.into(),
            existing_owner,
            context: ErrorContext::new(),
        }
    }

    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        EngineError::BackendUnavailable {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
            || matches!(self, EngineError::Backend(b) if b.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
            || matches!(self, EngineError::Backend(b) if b.is_conflict())
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, EngineError::ConstraintViolation { .. })
    }

    /// Transient: a caller may retry the same operation and plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. }
                | EngineError::Timeout(..)
                | EngineError::BackendUnavailable { .. }
                | EngineError::LockHeld { .. }
                | EngineError::LockTimeout { .. }
        )
    }

    /// Permanent: retrying without changing the request cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound { .. }
                | EngineError::Unauthorized { .. }
                | EngineError::InvalidData { .. }
                | EngineError::InvalidConfig { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
