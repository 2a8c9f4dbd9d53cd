// ABOUTME: Object-key grammar and version-token newtypes
// ABOUTME: Keys are validated once at construction so callers never pay for it twice

use crate::error::{BackendError, BackendResult};
use std::fmt;

/// A validated object key: non-empty UTF-8, forward-slash separated, no
/// leading slash, no embedded NUL, no `..` path components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn parse(raw: impl Into<String>) -> BackendResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(BackendError::invalid_data("object key cannot be empty"));
        }
        if raw.starts_with('/') {
            return Err(BackendError::invalid_data("object key cannot start with '/'"));
        }
        if raw.contains('\0') {
            return Err(BackendError::invalid_data("object key contains a NUL byte"));
        }
        if raw.split('/').any(|segment| segment == "..") {
            return Err(BackendError::invalid_data("object key contains a '..' component"));
        }
        Ok(ObjectKey(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First path segment, the entity type that namespaces extractors and
    /// constraints.
    pub fn entity_type(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque version token. Compares by equality only — never ordered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        VersionToken(raw.into())
    }

    /// The empty token, used by `put_if_match` to mean "unconditional write".
    pub fn unconditional() -> Self {
        VersionToken(String::new())
    }

    pub fn is_unconditional(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_leading_slash() {
        assert!(ObjectKey::parse("").is_err());
        assert!(ObjectKey::parse("/users/a.json").is_err());
    }

    #[test]
    fn rejects_dotdot_components() {
        assert!(ObjectKey::parse("users/../a.json").is_err());
    }

    #[test]
    fn accepts_valid_keys_and_extracts_entity_type() {
        let key = ObjectKey::parse("users/a.json").unwrap();
        assert_eq!(key.entity_type(), "users");
        assert_eq!(key.as_str(), "users/a.json");
    }

    #[test]
    fn unconditional_token_is_empty() {
        let token = VersionToken::unconditional();
        assert!(token.is_unconditional());
    }
}
