// ABOUTME: Per-query instrumentation: complexity class, fallback path, storage-op count, duration
// ABOUTME: Drained into the metrics sink by an optional exporter; never required for correctness

use crate::metrics::{MetricsSink, Tags};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    O1,
    ON,
}

impl Complexity {
    fn as_str(self) -> &'static str {
        match self {
            Complexity::O1 => "O(1)",
            Complexity::ON => "O(N)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryProfile {
    pub method: String,
    pub duration: Duration,
    pub complexity: Complexity,
    pub storage_op_count: u64,
    pub result_count: usize,
    pub fallback_path: bool,
    pub index_used: String,
    pub error: Option<String>,
}

/// One in-flight measurement; `finish` converts it into a [`QueryProfile`]
/// and records it.
pub struct QuerySpan<'a> {
    profiler: &'a QueryProfiler,
    method: String,
    start: Instant,
    storage_op_count: u64,
}

impl<'a> QuerySpan<'a> {
    pub fn record_storage_op(&mut self) {
        self.storage_op_count += 1;
    }

    pub fn finish(
        self,
        complexity: Complexity,
        result_count: usize,
        fallback_path: bool,
        index_used: impl Into<String>,
        error: Option<String>,
    ) {
        let profile = QueryProfile {
            method: self.method,
            duration: self.start.elapsed(),
            complexity,
            storage_op_count: self.storage_op_count,
            result_count,
            fallback_path,
            index_used: index_used.into(),
            error,
        };
        self.profiler.record(profile);
    }
}

/// Collects recent [`QueryProfile`]s and mirrors them to an injected
/// [`MetricsSink`]. The in-memory ring is bounded so long-running processes
/// don't accumulate unbounded profile history.
pub struct QueryProfiler {
    recent: Mutex<Vec<QueryProfile>>,
    capacity: usize,
    metrics: std::sync::Arc<dyn MetricsSink>,
}

impl QueryProfiler {
    pub fn new(metrics: std::sync::Arc<dyn MetricsSink>, capacity: usize) -> Self {
        Self {
            recent: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            metrics,
        }
    }

    pub fn start(&self, method: impl Into<String>) -> QuerySpan<'_> {
        QuerySpan {
            profiler: self,
            method: method.into(),
            start: Instant::now(),
            storage_op_count: 0,
        }
    }

    fn record(&self, profile: QueryProfile) {
        let tags: Tags = vec![
            ("complexity", profile.complexity.as_str().to_string()),
            ("fallback", profile.fallback_path.to_string()),
        ];
        self.metrics.timing(&format!("{}_duration", profile.method), profile.duration, &tags);

        let mut recent = self.recent.lock();
        if recent.len() >= self.capacity {
            recent.remove(0);
        }
        recent.push(profile);
    }

    pub fn recent(&self) -> Vec<QueryProfile> {
        self.recent.lock().clone()
    }
}
