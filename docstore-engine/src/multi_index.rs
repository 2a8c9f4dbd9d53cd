// ABOUTME: In-memory set-valued secondary index keyed by (entity, field, value)
// ABOUTME: Extractors are boxed closures owned by the registry, replayed wholesale for rebuild

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use docstore_backend::ObjectKey;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// One `(field, value)` pair pulled out of a document by an extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub field: String,
    pub value: String,
}

/// Pure function producing zero or more index entries from a document's raw
/// bytes. Errors cause that document to be silently skipped for this index —
/// schemaless documents routinely lack optional fields.
pub type Extractor = Arc<dyn Fn(&ObjectKey, &[u8]) -> EngineResult<Vec<IndexEntry>> + Send + Sync>;

/// Backing store for set-valued index entries. `DashMap` satisfies this
/// directly; the trait exists so an absent substrate can be modeled
/// uniformly rather than special-cased at every call site.
pub trait IndexSubstrate: Send + Sync {
    fn sadd(&self, set_key: &str, member: ObjectKey);
    fn srem(&self, set_key: &str, member: &ObjectKey);
    fn smembers(&self, set_key: &str) -> Vec<ObjectKey>;
    fn scard(&self, set_key: &str) -> usize;
}

#[derive(Default)]
pub struct InMemorySubstrate {
    sets: DashMap<String, HashSet<ObjectKey>>,
}

impl IndexSubstrate for InMemorySubstrate {
    fn sadd(&self, set_key: &str, member: ObjectKey) {
        self.sets.entry(set_key.to_string()).or_default().insert(member);
    }

    fn srem(&self, set_key: &str, member: &ObjectKey) {
        if let Some(mut set) = self.sets.get_mut(set_key) {
            set.remove(member);
        }
    }

    fn smembers(&self, set_key: &str) -> Vec<ObjectKey> {
        self.sets
            .get(set_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn scard(&self, set_key: &str) -> usize {
        self.sets.get(set_key).map(|s| s.len()).unwrap_or(0)
    }
}

fn set_key(entity: &str, field: &str, value: &str) -> String {
    format!("idx:{entity}:{field}:{value}")
}

/// Flat-field extractor: lifts `doc[field_name]` when it is a non-empty
/// string.
pub fn flat_field_extractor(field_name: impl Into<String>) -> Extractor {
    let field_name = field_name.into();
    Arc::new(move |_key, bytes| {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::invalid_data(format!("extractor parse failure: {e}")))?;
        let Some(s) = value.get(&field_name).and_then(|v| v.as_str()) else {
            return Ok(vec![]);
        };
        if s.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![IndexEntry {
            field: field_name.clone(),
            value: s.to_string(),
        }])
    })
}

/// Nested-field extractor: walks a `.`-separated path of object keys.
pub fn nested_field_extractor(path: impl Into<String>) -> Extractor {
    let path_str = path.into();
    let segments: Vec<String> = path_str.split('.').map(str::to_string).collect();
    Arc::new(move |_key, bytes| {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::invalid_data(format!("extractor parse failure: {e}")))?;
        let mut cursor = &value;
        for segment in &segments {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => return Ok(vec![]),
            }
        }
        let Some(s) = cursor.as_str() else { return Ok(vec![]) };
        if s.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![IndexEntry {
            field: path_str.clone(),
            value: s.to_string(),
        }])
    })
}

/// Registry of per-entity extractors plus the set substrate they populate.
pub struct MultiIndex {
    substrate: Option<Arc<dyn IndexSubstrate>>,
    extractors: DashMap<String, Vec<Extractor>>,
}

impl MultiIndex {
    pub fn new(substrate: Option<Arc<dyn IndexSubstrate>>) -> Self {
        Self {
            substrate,
            extractors: DashMap::new(),
        }
    }

    pub fn with_in_memory_substrate() -> Self {
        Self::new(Some(Arc::new(InMemorySubstrate::default())))
    }

    pub fn register_extractor(&self, entity: impl Into<String>, extractor: Extractor) {
        self.extractors.entry(entity.into()).or_default().push(extractor);
    }

    fn extractors_for(&self, entity: &str) -> Vec<Extractor> {
        self.extractors
            .get(entity)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Best-effort: absent substrate silently no-ops per the substrate
    /// contract (write ops succeed, read ops fail `BackendUnavailable`).
    pub fn update(&self, key: &ObjectKey, bytes: &[u8]) {
        let Some(substrate) = &self.substrate else {
            return;
        };
        for extractor in self.extractors_for(key.entity_type()) {
            match extractor(key, bytes) {
                Ok(entries) => {
                    for entry in entries {
                        substrate.sadd(&set_key(key.entity_type(), &entry.field, &entry.value), key.clone());
                    }
                }
                Err(err) => {
                    debug!(key = key.as_str(), error = %err, "extractor skipped document");
                }
            }
        }
    }

    pub fn remove(&self, key: &ObjectKey, bytes: &[u8]) {
        let Some(substrate) = &self.substrate else {
            return;
        };
        for extractor in self.extractors_for(key.entity_type()) {
            match extractor(key, bytes) {
                Ok(entries) => {
                    for entry in entries {
                        substrate.srem(&set_key(key.entity_type(), &entry.field, &entry.value), key);
                    }
                }
                Err(err) => {
                    debug!(key = key.as_str(), error = %err, "extractor skipped document on remove");
                }
            }
        }
    }

    pub fn replace(&self, key: &ObjectKey, old_bytes: Option<&[u8]>, new_bytes: Option<&[u8]>) {
        if let Some(old) = old_bytes {
            self.remove(key, old);
        }
        if let Some(new) = new_bytes {
            self.update(key, new);
        }
    }

    pub fn query(&self, entity: &str, field: &str, value: &str) -> EngineResult<Vec<ObjectKey>> {
        let substrate = self
            .substrate
            .as_ref()
            .ok_or_else(|| EngineError::backend_unavailable("index substrate not configured"))?;
        Ok(substrate.smembers(&set_key(entity, field, value)))
    }

    pub fn query_multi(&self, entity: &str, field: &str, values: &[String]) -> EngineResult<Vec<ObjectKey>> {
        let mut union: HashSet<ObjectKey> = HashSet::new();
        for value in values {
            union.extend(self.query(entity, field, value)?);
        }
        Ok(union.into_iter().collect())
    }

    pub fn count(&self, entity: &str, field: &str, value: &str) -> EngineResult<usize> {
        let substrate = self
            .substrate
            .as_ref()
            .ok_or_else(|| EngineError::backend_unavailable("index substrate not configured"))?;
        Ok(substrate.scard(&set_key(entity, field, value)))
    }

    /// Removes a single known-stale member from `idx:{entity}:{field}:{value}`,
    /// used by `HealthMonitor::repair` for `stale_in_index` entries where the
    /// triple is already known rather than re-derived via an extractor.
    pub fn remove_entry(&self, entity: &str, field: &str, value: &str, member: &ObjectKey) {
        if let Some(substrate) = &self.substrate {
            substrate.srem(&set_key(entity, field, value), member);
        }
    }

    pub fn has_substrate(&self) -> bool {
        self.substrate.is_some()
    }

    /// Replays every supplied object through `extractor`, for repair or
    /// initial backfill onto a newly registered index.
    pub fn rebuild(&self, objects: &[(ObjectKey, Vec<u8>)]) {
        if self.substrate.is_none() {
            warn!("rebuild requested with no index substrate configured");
            return;
        }
        for (key, bytes) in objects {
            self.update(key, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_field_extractor_skips_missing_and_empty_values() {
        let extractor = flat_field_extractor("role");
        let key = ObjectKey::parse("users/a.json").unwrap();

        assert!(extractor(&key, br#"{"role": "admin"}"#).unwrap()[0].value == "admin");
        assert!(extractor(&key, br#"{}"#).unwrap().is_empty());
        assert!(extractor(&key, br#"{"role": ""}"#).unwrap().is_empty());
    }

    #[test]
    fn nested_field_extractor_walks_path() {
        let extractor = nested_field_extractor("profile.city");
        let key = ObjectKey::parse("users/a.json").unwrap();
        let entries = extractor(&key, br#"{"profile": {"city": "Boston"}}"#).unwrap();
        assert_eq!(entries[0].value, "Boston");
    }

    #[test]
    fn update_then_remove_restores_empty_membership() {
        let index = MultiIndex::with_in_memory_substrate();
        index.register_extractor("users", flat_field_extractor("role"));
        let key = ObjectKey::parse("users/a.json").unwrap();
        let bytes = br#"{"role": "admin"}"#;

        index.update(&key, bytes);
        assert_eq!(index.query("users", "role", "admin").unwrap(), vec![key.clone()]);

        index.remove(&key, bytes);
        assert!(index.query("users", "role", "admin").unwrap().is_empty());
    }

    #[test]
    fn update_is_idempotent() {
        let index = MultiIndex::with_in_memory_substrate();
        index.register_extractor("users", flat_field_extractor("role"));
        let key = ObjectKey::parse("users/a.json").unwrap();
        let bytes = br#"{"role": "admin"}"#;

        index.update(&key, bytes);
        index.update(&key, bytes);
        assert_eq!(index.count("users", "role", "admin").unwrap(), 1);
    }

    #[test]
    fn query_without_substrate_is_backend_unavailable() {
        let index = MultiIndex::new(None);
        let err = index.query("users", "role", "admin").unwrap_err();
        assert!(matches!(err, EngineError::BackendUnavailable { .. }));
    }
}
