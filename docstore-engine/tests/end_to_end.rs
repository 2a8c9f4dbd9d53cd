// ABOUTME: Integration tests for the six end-to-end scenarios against a real FilesystemBackend

use docstore_backend::{Backend, FilesystemBackend, FilesystemConfig, ObjectKey};
use docstore_engine::config::EngineConfig;
use docstore_engine::constraint_manager::{ConstraintManager, UniqueConstraint};
use docstore_engine::index_coordinator::IndexCoordinator;
use docstore_engine::migration::{self, HasSchemaVersion, MigrationRegistry};
use docstore_engine::multi_index::{flat_field_extractor, MultiIndex};
use docstore_engine::query_profiler::{Complexity, QueryProfiler};
use docstore_engine::{EngineError, NoopMetrics, Store};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

fn backend(dir: &tempfile::TempDir) -> Arc<FilesystemBackend> {
    Arc::new(FilesystemBackend::new(dir.path(), FilesystemConfig::default()))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Counter {
    n: i64,
}

impl HasSchemaVersion for Counter {
    fn expected_version() -> i32 {
        0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct User {
    email: String,
    role: Option<String>,
}

impl HasSchemaVersion for User {
    fn expected_version() -> i32 {
        0
    }
}

#[tokio::test]
async fn scenario_1_atomic_crash_safety() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let key = ObjectKey::parse("users/a.json").unwrap();

    backend.put(&key, b"V1".to_vec(), &cancel()).await.unwrap();
    let bytes = backend.get(&key, &cancel()).await.unwrap();
    assert_eq!(bytes, b"V1");
}

#[tokio::test]
async fn scenario_2_unique_constraint_race() {
    let dir = tempfile::tempdir().unwrap();
    let fs_backend = backend(&dir);
    let store = Store::new(fs_backend.clone(), EngineConfig::default());
    let index = MultiIndex::with_in_memory_substrate();
    let constraints = ConstraintManager::new(Default::default());
    constraints.register(
        UniqueConstraint::new(
            "users",
            "email",
            Arc::new(|bytes| {
                let v: serde_json::Value = serde_json::from_slice(bytes).ok()?;
                v.get("email")?.as_str().map(str::to_string)
            }),
        )
        .with_normalizer(Arc::new(|s| s.to_lowercase())),
    );
    let coordinator = IndexCoordinator::new(&store, &index, &constraints);

    let key_a = ObjectKey::parse("users/a.json").unwrap();
    let key_b = ObjectKey::parse("users/b.json").unwrap();
    let doc_a = serde_json::to_vec(&json!({"email": "X@Y.com"})).unwrap();
    let doc_b = serde_json::to_vec(&json!({"email": "x@y.COM"})).unwrap();

    let result_a = coordinator.create(&key_a, "users", doc_a, &cancel()).await;
    let result_b = coordinator.create(&key_b, "users", doc_b, &cancel()).await;

    let successes = [&result_a, &result_b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one creator should win the unique claim");

    let failure = if result_a.is_err() { &result_a } else { &result_b };
    match failure {
        Err(EngineError::ConstraintViolation { entity, field, value, .. }) => {
            assert_eq!(entity, "users");
            assert_eq!(field, "email");
            assert_eq!(value, "x@y.com");
        }
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UserV2 {
    #[serde(rename = "_v")]
    v: i32,
    id: String,
    email: String,
    phone: String,
    first: String,
    last: String,
}

impl HasSchemaVersion for UserV2 {
    fn expected_version() -> i32 {
        2
    }
}

#[tokio::test]
async fn scenario_3_migration_0_to_2_with_split() {
    let dir = tempfile::tempdir().unwrap();
    let fs_backend = backend(&dir);
    let mut config = EngineConfig::default();
    config.migration_policy = docstore_engine::config::MigrationPolicy::MigrateAndWrite;
    let registry = Arc::new(MigrationRegistry::new());
    registry.register("users", 0, 1, migration::add_field(1, "phone", json!("")));
    registry.register("users", 1, 2, migration::split_field(2, "name", " ", "first", "last"));

    let store = Store::new(fs_backend.clone(), config).with_migrations(registry);
    let key = ObjectKey::parse("users/1.json").unwrap();
    let raw = serde_json::to_vec(&json!({"id": "1", "email": "e", "name": "Alice Smith"})).unwrap();
    fs_backend.put(&key, raw, &cancel()).await.unwrap();

    let user: UserV2 = store.get_json(&key, "users", &cancel()).await.unwrap();
    assert_eq!(user.v, 2);
    assert_eq!(user.phone, "");
    assert_eq!(user.first, "Alice");
    assert_eq!(user.last, "Smith");

    let raw_after = fs_backend.get(&key, &cancel()).await.unwrap();
    let reparsed: serde_json::Value = serde_json::from_slice(&raw_after).unwrap();
    assert_eq!(reparsed["_v"], 2, "MigrateAndWrite should persist the migrated bytes");
}

#[tokio::test]
async fn scenario_4_cas_retry_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let fs_backend = backend(&dir);
    let store = Arc::new(Store::new(fs_backend.clone(), EngineConfig::default()));
    let key = ObjectKey::parse("counter.json").unwrap();
    fs_backend
        .put(&key, serde_json::to_vec(&Counter { n: 0 }).unwrap(), &cancel())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store
                .update_derived::<Counter, _>(&key, |c| Counter { n: c.n + 1 }, &CancellationToken::new())
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let (final_value, _) = store
        .get_json_with_version::<Counter>(&key, "counter", &cancel())
        .await
        .unwrap();
    assert_eq!(final_value.n, 50);
}

#[tokio::test]
async fn scenario_5_fallback_query() {
    let dir = tempfile::tempdir().unwrap();
    let fs_backend = backend(&dir);
    let store = Store::new(fs_backend.clone(), EngineConfig::default());
    let index = MultiIndex::new(None);
    let profiler = QueryProfiler::new(Arc::new(NoopMetrics), 16);

    for i in 0..5 {
        let key = ObjectKey::parse(format!("users/{i}.json")).unwrap();
        let role = if i < 2 { "admin" } else { "member" };
        let bytes = serde_json::to_vec(&User { email: format!("u{i}@example.com"), role: Some(role.to_string()) }).unwrap();
        fs_backend.put(&key, bytes, &cancel()).await.unwrap();
    }

    let results: Vec<User> = docstore_engine::operations::query_with_fallback(
        &store,
        &index,
        &profiler,
        "users",
        "role",
        "admin",
        "users/",
        |u: &User| u.role.as_deref() == Some("admin"),
        &cancel(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 2);
    let profile = profiler.recent().pop().unwrap();
    assert_eq!(profile.complexity, Complexity::ON);
    assert!(profile.fallback_path);
    assert_eq!(profile.index_used, "none:full-scan");
}

#[tokio::test]
async fn scenario_6_drift_detection_and_repair() {
    let dir = tempfile::tempdir().unwrap();
    let fs_backend = backend(&dir);
    let store = Arc::new(Store::new(fs_backend.clone(), EngineConfig::default()));
    let index = Arc::new(MultiIndex::with_in_memory_substrate());
    index.register_extractor("users", flat_field_extractor("email"));

    for i in 0..5 {
        let key = ObjectKey::parse(format!("users/u{i}.json")).unwrap();
        let bytes = serde_json::to_vec(&json!({"email": format!("u{i}@example.com")})).unwrap();
        fs_backend.put(&key, bytes.clone(), &cancel()).await.unwrap();
        index.update(&key, &bytes);
    }

    index.remove_entry("users", "email", "u0@example.com", &ObjectKey::parse("users/u0.json").unwrap());

    let monitor = docstore_engine::HealthMonitor::new(
        store.clone(),
        index.clone(),
        vec![("users".to_string(), flat_field_extractor("email"))],
        10,
        5.0,
        std::time::Duration::from_secs(60),
        Arc::new(NoopMetrics),
    );

    let report = monitor.check("users", &cancel()).await.unwrap();
    assert!(report.missing_in_index.iter().any(|k| k.as_str() == "users/u0.json"));
    assert!(report.drift_percentage > 0.0);

    monitor.repair(&report, &cancel()).await;

    let report_after = monitor.check("users", &cancel()).await.unwrap();
    assert_eq!(report_after.drift_percentage, 0.0);

    let members = index.query("users", "email", "u0@example.com").unwrap();
    assert_eq!(members, vec![ObjectKey::parse("users/u0.json").unwrap()]);
}
