// ABOUTME: Fallback query (index-or-scan) and batched parallel get/put/delete helpers
// ABOUTME: Batched ops fan out via JoinSet, bounded by the key count, and honor cancellation

use crate::error::{EngineError, EngineResult};
use crate::multi_index::MultiIndex;
use crate::query_profiler::{Complexity, QueryProfiler};
use crate::store::Store;
use docstore_backend::ObjectKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// `query_with_fallback`: serve from the index when available, otherwise
/// scan `scan_prefix` and apply `filter_fn` in-process. Always profiled.
pub async fn query_with_fallback<T, F>(
    store: &Store,
    index: &MultiIndex,
    profiler: &QueryProfiler,
    entity: &str,
    field: &str,
    value: &str,
    scan_prefix: &str,
    filter_fn: F,
    cancel: &CancellationToken,
) -> EngineResult<Vec<T>>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(&T) -> bool,
{
    let mut span = profiler.start("query_with_fallback");

    if index.has_substrate() {
        let keys = match index.query(entity, field, value) {
            Ok(keys) => keys,
            Err(err) => {
                span.finish(Complexity::O1, 0, false, format!("idx:{entity}:{field}"), Some(err.to_string()));
                return Err(err);
            }
        };
        let outcomes = batch_get::<T>(store, &keys, cancel).await;
        span.record_storage_op();
        let results: Vec<T> = outcomes.into_iter().filter_map(|o| o.value).collect();
        let count = results.len();
        span.finish(Complexity::O1, count, false, format!("idx:{entity}:{field}"), None);
        return Ok(results);
    }

    let keys = store.list(scan_prefix, cancel).await?;
    span.record_storage_op();
    let outcomes = batch_get::<T>(store, &keys, cancel).await;
    let results: Vec<T> = outcomes
        .into_iter()
        .filter_map(|o| o.value)
        .filter(|v| filter_fn(v))
        .collect();
    let count = results.len();
    span.finish(Complexity::ON, count, true, "none:full-scan", None);
    Ok(results)
}

/// Per-key outcome of a batched operation. `value`/`error` are mutually
/// exclusive; a cancelled operation surfaces `error` with no `value`.
pub struct BatchOutcome<T> {
    pub key: ObjectKey,
    pub value: Option<T>,
    pub error: Option<EngineError>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

pub fn analyze<T>(outcomes: &[BatchOutcome<T>]) -> BatchSummary {
    let succeeded = outcomes.iter().filter(|o| o.value.is_some()).count();
    BatchSummary {
        succeeded,
        failed: outcomes.len() - succeeded,
    }
}

/// Fans out one read per key, bounded by the key count. Missing/erroring
/// keys are reported per-outcome rather than failing the whole batch;
/// cancellation aborts outstanding reads and the partial result is returned.
pub async fn batch_get<T>(store: &Store, keys: &[ObjectKey], cancel: &CancellationToken) -> Vec<BatchOutcome<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let backend = store.backend().clone();
    let mut set = JoinSet::new();
    for key in keys.iter().cloned() {
        let backend = backend.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            if cancel.is_cancelled() {
                return BatchOutcome {
                    key: key.clone(),
                    value: None,
                    error: Some(EngineError::backend_unavailable("cancelled")),
                };
            }
            match backend.get(&key, &cancel).await {
                Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(value) => BatchOutcome { key, value: Some(value), error: None },
                    Err(e) => BatchOutcome { key, value: None, error: Some(EngineError::invalid_data(e.to_string())) },
                },
                Err(err) => BatchOutcome { key, value: None, error: Some(err.into()) },
            }
        });
    }

    let mut outcomes = Vec::with_capacity(keys.len());
    while let Some(result) = set.join_next().await {
        if let Ok(outcome) = result {
            outcomes.push(outcome);
        }
    }
    outcomes
}

pub async fn batch_put<T>(
    store: &Store,
    items: Vec<(ObjectKey, T)>,
    cancel: &CancellationToken,
) -> Vec<BatchOutcome<()>>
where
    T: Serialize + Send + 'static,
{
    let backend = store.backend().clone();
    let mut set = JoinSet::new();
    for (key, value) in items {
        let backend = backend.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            if cancel.is_cancelled() {
                return BatchOutcome { key: key.clone(), value: None, error: Some(EngineError::backend_unavailable("cancelled")) };
            }
            let outcome = match serde_json::to_vec(&value) {
                Ok(bytes) => match backend.put(&key, bytes, &cancel).await {
                    Ok(()) => BatchOutcome { key: key.clone(), value: Some(()), error: None },
                    Err(err) => BatchOutcome { key: key.clone(), value: None, error: Some(err.into()) },
                },
                Err(e) => BatchOutcome { key: key.clone(), value: None, error: Some(EngineError::invalid_data(e.to_string())) },
            };
            outcome
        });
    }

    let mut outcomes = Vec::new();
    while let Some(result) = set.join_next().await {
        if let Ok(outcome) = result {
            outcomes.push(outcome);
        }
    }
    outcomes
}

pub async fn batch_delete(store: &Store, keys: &[ObjectKey], cancel: &CancellationToken) -> Vec<BatchOutcome<()>> {
    let backend = store.backend().clone();
    let mut set = JoinSet::new();
    for key in keys.iter().cloned() {
        let backend = backend.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            if cancel.is_cancelled() {
                return BatchOutcome { key: key.clone(), value: None, error: Some(EngineError::backend_unavailable("cancelled")) };
            }
            match backend.delete(&key, &cancel).await {
                Ok(()) => BatchOutcome { key, value: Some(()), error: None },
                Err(err) => BatchOutcome { key, value: None, error: Some(err.into()) },
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(result) = set.join_next().await {
        if let Ok(outcome) = result {
            outcomes.push(outcome);
        }
    }
    outcomes
}
