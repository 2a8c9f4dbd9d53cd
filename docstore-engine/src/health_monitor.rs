// ABOUTME: Sample-based consistency checker between documents and the secondary index
// ABOUTME: start()/stop() run check-then-repair on a ticker, mirroring a periodic background task

use crate::metrics::{MetricsSink, Tags};
use crate::multi_index::{Extractor, MultiIndex};
use crate::store::Store;
use docstore_backend::ObjectKey;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub entity: String,
    pub sampled: usize,
    pub missing_in_index: Vec<ObjectKey>,
    pub stale_in_index: Vec<(String, ObjectKey)>,
    pub drift_percentage: f64,
}

pub struct HealthMonitor {
    store: Arc<Store>,
    index: Arc<MultiIndex>,
    extractors: Vec<(String, Extractor)>,
    sample_size: usize,
    drift_threshold_pct: f64,
    interval: Duration,
    metrics: Arc<dyn MetricsSink>,
    stop_token: AsyncMutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<Store>,
        index: Arc<MultiIndex>,
        extractors: Vec<(String, Extractor)>,
        sample_size: usize,
        drift_threshold_pct: f64,
        interval: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            index,
            extractors,
            sample_size,
            drift_threshold_pct,
            interval,
            metrics,
            stop_token: AsyncMutex::new(None),
        }
    }

    /// Lists objects under `{entity}/` (or every object if `entity` is
    /// empty), samples up to `sample_size`, and checks each sampled
    /// document's extracted fields against the index.
    pub async fn check(&self, entity: &str, cancel: &CancellationToken) -> docstore_backend::BackendResult<DriftReport> {
        let prefix = if entity.is_empty() { String::new() } else { format!("{entity}/") };
        let mut keys = self.store.backend().list(&prefix, cancel).await?;
        keys.shuffle(&mut rand::thread_rng());
        keys.truncate(self.sample_size);

        let mut missing_in_index = Vec::new();
        let mut sampled = 0usize;

        for key in &keys {
            let Ok(bytes) = self.store.backend().get(key, cancel).await else {
                continue;
            };
            sampled += 1;
            for (target_entity, extractor) in &self.extractors {
                if target_entity != key.entity_type() {
                    continue;
                }
                let Ok(entries) = extractor(key, &bytes) else { continue };
                for entry in entries {
                    let members = self
                        .index
                        .query(key.entity_type(), &entry.field, &entry.value)
                        .unwrap_or_default();
                    if !members.contains(key) {
                        missing_in_index.push(key.clone());
                    }
                }
            }
        }

        let drift_percentage = if sampled == 0 {
            0.0
        } else {
            (missing_in_index.len() as f64 / sampled as f64) * 100.0
        };

        let report = DriftReport {
            entity: entity.to_string(),
            sampled,
            missing_in_index,
            stale_in_index: Vec::new(),
            drift_percentage,
        };

        let tags: Tags = vec![("entity", entity.to_string())];
        self.metrics.gauge("drift_percentage", report.drift_percentage, &tags);
        Ok(report)
    }

    /// Re-derives index entries for every `missing_in_index` key and drops
    /// every `stale_in_index` member. Individual failures are logged, not
    /// propagated — repair is itself best-effort.
    pub async fn repair(&self, report: &DriftReport, cancel: &CancellationToken) {
        let mut repairs_performed = 0u64;
        for key in &report.missing_in_index {
            match self.store.backend().get(key, cancel).await {
                Ok(bytes) => {
                    self.index.update(key, &bytes);
                    repairs_performed += 1;
                }
                Err(err) => warn!(key = key.as_str(), error = %err, "repair could not re-read document"),
            }
        }

        for (index_key, object_key) in &report.stale_in_index {
            if let Some((entity, rest)) = index_key.strip_prefix("idx:").and_then(|r| r.split_once(':')) {
                if let Some((field, value)) = rest.split_once(':') {
                    self.index.remove_entry(entity, field, value, object_key);
                    repairs_performed += 1;
                }
            }
        }

        info!(repairs_performed, entity = report.entity, "health repair complete");
        let tags: Tags = vec![("entity", report.entity.clone())];
        self.metrics.increment("repairs_performed", &tags);
    }

    /// Runs `check` on a ticker for `entity`; invokes `repair` whenever
    /// drift reaches the configured threshold. Returns a token the caller
    /// can cancel via [`Self::stop`].
    pub async fn start(self: Arc<Self>, entity: String) {
        let token = CancellationToken::new();
        *self.stop_token.lock().await = Some(token.clone());
        info!(entity, "health monitor started");

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let cancel = CancellationToken::new();
                    match self.check(&entity, &cancel).await {
                        Ok(report) if report.drift_percentage >= self.drift_threshold_pct => {
                            self.repair(&report, &cancel).await;
                        }
                        Ok(_) => {}
                        Err(err) => warn!(entity, error = %err, "health check failed"),
                    }
                }
            }
        }
        info!(entity, "health monitor stopped");
    }

    pub async fn stop(&self) {
        if let Some(token) = self.stop_token.lock().await.take() {
            token.cancel();
        }
    }
}
