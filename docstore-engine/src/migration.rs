// ABOUTME: Graph of (type, from_version -> to_version) transformers, applied via BFS shortest path
// ABOUTME: Held explicitly by Store -- no process-global registry

use crate::error::{EngineError, EngineResult};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub type JsonMap = Map<String, Value>;
pub type Transform = Arc<dyn Fn(JsonMap) -> EngineResult<JsonMap> + Send + Sync>;

/// Implemented by destination types to name the schema version they expect,
/// in place of runtime reflection over a `_v` field.
pub trait HasSchemaVersion {
    fn expected_version() -> i32;
}

#[derive(Clone)]
struct MigrationHop {
    from: i32,
    to: i32,
    transform: Transform,
}

/// Registered hops for one document type, keyed by source version so BFS
/// can enumerate outgoing edges cheaply.
#[derive(Default)]
struct TypeGraph {
    hops_from: HashMap<i32, Vec<MigrationHop>>,
}

pub struct MigrationRegistry {
    types: parking_lot::RwLock<HashMap<String, TypeGraph>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self {
            types: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, type_name: impl Into<String>, from: i32, to: i32, transform: Transform) {
        let mut types = self.types.write();
        let graph = types.entry(type_name.into()).or_default();
        graph.hops_from.entry(from).or_default().push(MigrationHop { from, to, transform });
    }

    pub fn has_migrations(&self) -> bool {
        !self.types.read().is_empty()
    }

    fn version_of(doc: &JsonMap) -> i32 {
        doc.get("_v").and_then(Value::as_i64).unwrap_or(0) as i32
    }

    /// BFS shortest hop-path from `from` to `to` within `type_name`'s graph.
    fn find_path(&self, type_name: &str, from: i32, to: i32) -> Option<Vec<MigrationHop>> {
        let types = self.types.read();
        let graph = types.get(type_name)?;

        let mut queue = VecDeque::new();
        let mut came_from: HashMap<i32, (i32, MigrationHop)> = HashMap::new();
        let mut visited = std::collections::HashSet::new();
        queue.push_back(from);
        visited.insert(from);

        while let Some(version) = queue.pop_front() {
            if version == to {
                let mut path = Vec::new();
                let mut cur = to;
                while cur != from {
                    let (prev, hop) = came_from.get(&cur)?.clone();
                    path.push(hop);
                    cur = prev;
                }
                path.reverse();
                return Some(path);
            }
            for hop in graph.hops_from.get(&version).into_iter().flatten() {
                if visited.insert(hop.to) {
                    came_from.insert(hop.to, (version, hop.clone()));
                    queue.push_back(hop.to);
                }
            }
        }
        None
    }

    /// Migrates `bytes` (parsed as a generic JSON map) for `type_name` from
    /// its recorded `_v` up to `expected_version`. Returns `None` if no
    /// migration was necessary (already at the expected version).
    pub fn migrate(
        &self,
        type_name: &str,
        bytes: &[u8],
        expected_version: i32,
    ) -> EngineResult<Option<Vec<u8>>> {
        if !self.has_migrations() {
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::invalid_data(format!("document is not valid JSON: {e}")))?;
        let Value::Object(map) = value else {
            return Err(EngineError::invalid_data("document root is not a JSON object"));
        };

        let data_version = Self::version_of(&map);
        if data_version == expected_version {
            return Ok(None);
        }

        let path = self
            .find_path(type_name, data_version, expected_version)
            .ok_or_else(|| EngineError::NoMigrationPath {
                type_name: type_name.to_string(),
                from: data_version,
                to: expected_version,
                context: Default::default(),
            })?;

        let mut current = map;
        for hop in path {
            current = (hop.transform)(current)?;
        }

        let migrated = serde_json::to_vec(&Value::Object(current))
            .map_err(|e| EngineError::invalid_data(format!("failed to re-serialize migrated document: {e}")))?;
        Ok(Some(migrated))
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn set_version(mut map: JsonMap, version: i32) -> JsonMap {
    map.insert("_v".to_string(), Value::from(version));
    map
}

/// `AddField(name, default)`: inserts `name` with `default` if absent.
pub fn add_field(to: i32, name: impl Into<String>, default: Value) -> Transform {
    let name = name.into();
    Arc::new(move |mut map: JsonMap| {
        map.entry(name.clone()).or_insert(default.clone());
        Ok(set_version(map, to))
    })
}

/// `RenameField(old, new)`: moves the value at `old` to `new`, leaving `old`
/// absent. A missing `old` is a no-op.
pub fn rename_field(to: i32, old: impl Into<String>, new: impl Into<String>) -> Transform {
    let old = old.into();
    let new = new.into();
    Arc::new(move |mut map: JsonMap| {
        if let Some(value) = map.remove(&old) {
            map.insert(new.clone(), value);
        }
        Ok(set_version(map, to))
    })
}

/// `RemoveField(name)`: deletes `name` if present.
pub fn remove_field(to: i32, name: impl Into<String>) -> Transform {
    let name = name.into();
    Arc::new(move |mut map: JsonMap| {
        map.remove(&name);
        Ok(set_version(map, to))
    })
}

/// `Split(src, sep, dst1, dst2)`: splits the string at `src` on the first
/// occurrence of `sep` into `dst1`/`dst2`. Non-string or absent `src` leaves
/// the destinations unset.
pub fn split_field(
    to: i32,
    src: impl Into<String>,
    sep: impl Into<String>,
    dst1: impl Into<String>,
    dst2: impl Into<String>,
) -> Transform {
    let src = src.into();
    let sep = sep.into();
    let dst1 = dst1.into();
    let dst2 = dst2.into();
    Arc::new(move |mut map: JsonMap| {
        if let Some(Value::String(value)) = map.get(&src).cloned() {
            if let Some((first, rest)) = value.split_once(sep.as_str()) {
                map.insert(dst1.clone(), Value::String(first.to_string()));
                map.insert(dst2.clone(), Value::String(rest.to_string()));
            }
        }
        Ok(set_version(map, to))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bfs_finds_multi_hop_path() {
        let registry = MigrationRegistry::new();
        registry.register("users", 0, 1, add_field(1, "phone", Value::from("")));
        registry.register("users", 1, 2, split_field(2, "name", " ", "first", "last"));

        let mut doc = JsonMap::new();
        doc.insert("id".into(), Value::from("1"));
        doc.insert("email".into(), Value::from("e"));
        doc.insert("name".into(), Value::from("Alice Smith"));
        let bytes = serde_json::to_vec(&Value::Object(doc)).unwrap();

        let migrated = registry.migrate("users", &bytes, 2).unwrap().unwrap();
        let result: Value = serde_json::from_slice(&migrated).unwrap();
        assert_eq!(result["_v"], 2);
        assert_eq!(result["phone"], "");
        assert_eq!(result["first"], "Alice");
        assert_eq!(result["last"], "Smith");
    }

    #[test]
    fn no_path_errors_with_no_migration_path() {
        let registry = MigrationRegistry::new();
        registry.register("users", 0, 1, add_field(1, "phone", Value::from("")));
        let doc = JsonMap::new();
        let bytes = serde_json::to_vec(&Value::Object(doc)).unwrap();
        let result = registry.migrate("users", &bytes, 5);
        assert!(matches!(result, Err(EngineError::NoMigrationPath { .. })));
    }

    #[test]
    fn matching_version_is_a_fast_path_noop() {
        let registry = MigrationRegistry::new();
        registry.register("users", 0, 1, add_field(1, "phone", Value::from("")));
        let mut doc = JsonMap::new();
        doc.insert("_v".into(), Value::from(1));
        let bytes = serde_json::to_vec(&Value::Object(doc)).unwrap();
        assert!(registry.migrate("users", &bytes, 1).unwrap().is_none());
    }
}
