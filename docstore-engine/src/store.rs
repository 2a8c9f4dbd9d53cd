// ABOUTME: Thin typed JSON layer over Backend -- marshal/unmarshal, CAS-with-retry, migration-on-read
// ABOUTME: Every operation emits a debug span and a timing sample to the injected MetricsSink

use crate::config::{EngineConfig, MigrationPolicy};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricsSink, NoopMetrics, Tags};
use crate::migration::{HasSchemaVersion, MigrationRegistry};
use docstore_backend::{Backend, ObjectKey, VersionToken};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Typed JSON layer over an `Arc<dyn Backend>`, the way a storage adapter
/// wraps its backend trait object. Owns the backend; holds a non-owning
/// handle to the migration registry so multiple independent stores never
/// share mutable global state.
pub struct Store {
    backend: Arc<dyn Backend>,
    migrations: Arc<MigrationRegistry>,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        Self {
            backend,
            migrations: Arc::new(MigrationRegistry::new()),
            metrics: Arc::new(NoopMetrics),
            config,
        }
    }

    pub fn with_migrations(mut self, migrations: Arc<MigrationRegistry>) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn time<R>(&self, metric: &str, tag: &str, fut: impl std::future::Future<Output = R>) -> R {
        let start = Instant::now();
        let result = fut.await;
        let tags: Tags = vec![("key", tag.to_string())];
        self.metrics.timing(metric, start.elapsed(), &tags);
        result
    }

    async fn migrate_bytes<T: HasSchemaVersion>(
        &self,
        type_name: &str,
        key: &ObjectKey,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<u8>> {
        let expected = T::expected_version();
        match self.migrations.migrate(type_name, &bytes, expected)? {
            None => Ok(bytes),
            Some(migrated) => {
                if self.config.migration_policy == MigrationPolicy::MigrateAndWrite {
                    if let Err(err) = self
                        .backend
                        .put(key, migrated.clone(), cancel)
                        .await
                    {
                        warn!(key = key.as_str(), error = %err, "migration write-back failed");
                    }
                }
                Ok(migrated)
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned + HasSchemaVersion>(
        &self,
        key: &ObjectKey,
        type_name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<T> {
        let bytes = self.time("get_duration", key.as_str(), self.backend.get(key, cancel)).await?;
        let migrated = self.migrate_bytes::<T>(type_name, key, bytes, cancel).await?;
        debug!(key = key.as_str(), "get_json");
        serde_json::from_slice(&migrated).map_err(|e| EngineError::invalid_data(e.to_string()))
    }

    pub async fn get_json_with_version<T: DeserializeOwned + HasSchemaVersion>(
        &self,
        key: &ObjectKey,
        type_name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<(T, VersionToken)> {
        let (bytes, token) = self
            .time("get_duration", key.as_str(), self.backend.get_with_version(key, cancel))
            .await?;
        let migrated = self.migrate_bytes::<T>(type_name, key, bytes, cancel).await?;
        let value = serde_json::from_slice(&migrated).map_err(|e| EngineError::invalid_data(e.to_string()))?;
        Ok((value, token))
    }

    pub async fn put_json<T: Serialize + Sync>(
        &self,
        key: &ObjectKey,
        value: &T,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| EngineError::invalid_data(e.to_string()))?;
        self.time("put_duration", key.as_str(), self.backend.put(key, bytes, cancel)).await?;
        debug!(key = key.as_str(), "put_json");
        Ok(())
    }

    pub async fn put_json_with_version<T: Serialize + Sync>(
        &self,
        key: &ObjectKey,
        value: &T,
        expected: &VersionToken,
        cancel: &CancellationToken,
    ) -> EngineResult<VersionToken> {
        let bytes = serde_json::to_vec(value).map_err(|e| EngineError::invalid_data(e.to_string()))?;
        Ok(self
            .time("put_duration", key.as_str(), self.backend.put_if_match(key, bytes, expected, cancel))
            .await?)
    }

    /// Bounded-retry CAS loop for small derived/aggregate documents: read
    /// with version, mutate, put-if-match; retries with exponential backoff
    /// + jitter on `Conflict` up to `retry.max_retries`.
    pub async fn update_derived<T, F>(
        &self,
        key: &ObjectKey,
        mut mutate: F,
        cancel: &CancellationToken,
    ) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned + Sync,
        F: FnMut(T) -> T,
    {
        self.time("update_derived_duration", key.as_str(), async {
            let mut attempt = 0u32;
            loop {
                let (current, token) = self.backend.get_with_version(key, cancel).await?;
                let value: T =
                    serde_json::from_slice(&current).map_err(|e| EngineError::invalid_data(e.to_string()))?;
                let mutated = mutate(value);
                let bytes = serde_json::to_vec(&mutated).map_err(|e| EngineError::invalid_data(e.to_string()))?;

                match self.backend.put_if_match(key, bytes, &token, cancel).await {
                    Ok(_) => return Ok(mutated),
                    Err(err) if err.is_conflict() => {
                        attempt += 1;
                        if attempt > self.config.retry.max_retries {
                            return Err(EngineError::IndexRetriesExhausted {
                                key: key.as_str().to_string(),
                                attempts: attempt,
                                context: Default::default(),
                            });
                        }
                        let backoff = self.config.retry.backoff_for(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
    }

    pub async fn delete(&self, key: &ObjectKey, cancel: &CancellationToken) -> EngineResult<()> {
        Ok(self.time("delete_duration", key.as_str(), self.backend.delete(key, cancel)).await?)
    }

    pub async fn exists(&self, key: &ObjectKey, cancel: &CancellationToken) -> EngineResult<bool> {
        Ok(self.time("exists_duration", key.as_str(), self.backend.exists(key, cancel)).await?)
    }

    pub async fn list(&self, prefix: &str, cancel: &CancellationToken) -> EngineResult<Vec<ObjectKey>> {
        Ok(self.time("list_duration", prefix, self.backend.list(prefix, cancel)).await?)
    }

    pub async fn list_paginated(
        &self,
        prefix: &str,
        batch_fn: docstore_backend::PageCallback<'_>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        Ok(self
            .time(
                "list_duration",
                prefix,
                self.backend
                    .list_paginated(prefix, self.config.batch_page_size, batch_fn, cancel),
            )
            .await?)
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> EngineResult<()> {
        Ok(self.time("ping_duration", "ping", self.backend.ping(cancel)).await?)
    }

    /// No-op placeholder so callers have a single, explicit shutdown point;
    /// a future remote backend may flush connections here.
    pub async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore_backend::FilesystemBackend;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    impl HasSchemaVersion for Widget {
        fn expected_version() -> i32 {
            0
        }
    }

    fn store(dir: &tempfile::TempDir) -> Store {
        let backend = Arc::new(FilesystemBackend::new(dir.path(), Default::default()));
        Store::new(backend, EngineConfig::default())
    }

    #[tokio::test]
    async fn put_json_then_get_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = ObjectKey::parse("widgets/a.json").unwrap();
        let widget = Widget { name: "sprocket".into(), count: 3 };

        store.put_json(&key, &widget, &CancellationToken::new()).await.unwrap();
        let got: Widget = store.get_json(&key, "widgets", &CancellationToken::new()).await.unwrap();
        assert_eq!(got, widget);
    }

    #[tokio::test]
    async fn update_derived_exhausts_retries_on_permanent_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = ObjectKey::parse("missing/counter.json").unwrap();
        let result = store
            .update_derived::<Widget, _>(&key, |w| w, &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }
}
