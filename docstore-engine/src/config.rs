// ABOUTME: Every tunable knob the engine exposes, collected into one Default-derived config
// ABOUTME: Nested per concern (retry, health, breaker, filesystem) rather than one flat struct

use docstore_backend::FilesystemConfig;
use std::time::Duration;

/// CAS retry budget for [`crate::store::Store::update_derived`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Backoff for the `attempt`-th retry (0-indexed), with jitter applied.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_span = base * self.jitter;
        let jittered = base + rand::random::<f64>() * jitter_span * 2.0 - jitter_span;
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// [`crate::health_monitor::HealthMonitor`] tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub sample_size: usize,
    pub interval: Duration,
    pub drift_threshold_pct: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_size: 100,
            interval: Duration::from_secs(60),
            drift_threshold_pct: 5.0,
        }
    }
}

/// Circuit-breaker tuning for [`crate::constraint_manager::ConstraintManager`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Whether a migrated document is persisted back to storage on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPolicy {
    MigrateOnRead,
    MigrateAndWrite,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        MigrationPolicy::MigrateOnRead
    }
}

/// Every knob enumerated in the configuration surface, collected into one
/// value handed to [`crate::store::Store::new`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stripe_count: usize,
    pub retry: RetryConfig,
    pub batch_page_size: usize,
    pub migration_policy: MigrationPolicy,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub filesystem: FilesystemConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stripe_count: 32,
            retry: RetryConfig::default(),
            batch_page_size: 100,
            migration_policy: MigrationPolicy::default(),
            health: HealthConfig::default(),
            breaker: BreakerConfig::default(),
            filesystem: FilesystemConfig::default(),
        }
    }
}
