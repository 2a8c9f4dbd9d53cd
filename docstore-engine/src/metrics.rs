// ABOUTME: Injected metrics sink, defaulting to a no-op so the core needs no observability backend
// ABOUTME: Vocabulary: get_duration, put_error, index_update, lock_wait_time, drift_percentage, ...

use std::time::Duration;

/// Tag list attached to a metric sample; kept as owned pairs so callers can
/// build them inline without lifetime friction.
pub type Tags = Vec<(&'static str, String)>;

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, tags: &Tags);
    fn gauge(&self, name: &str, value: f64, tags: &Tags);
    fn timing(&self, name: &str, duration: Duration, tags: &Tags);
    fn histogram(&self, name: &str, value: f64, tags: &Tags);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _tags: &Tags) {}
    fn gauge(&self, _name: &str, _value: f64, _tags: &Tags) {}
    fn timing(&self, _name: &str, _duration: Duration, _tags: &Tags) {}
    fn histogram(&self, _name: &str, _value: f64, _tags: &Tags) {}
}
