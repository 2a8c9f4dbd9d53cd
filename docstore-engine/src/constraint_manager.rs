// ABOUTME: Atomic claim/release of unique (entity, field, normalized-value) tuples
// ABOUTME: Guarded by a three-state circuit breaker so a down substrate fails fast, not slow

use crate::config::BreakerConfig;
use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use docstore_backend::ObjectKey;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub type ValueExtractor = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;
pub type Normalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct UniqueConstraint {
    pub entity_type: String,
    pub field_name: String,
    pub extractor: ValueExtractor,
    pub normalizer: Option<Normalizer>,
}

impl UniqueConstraint {
    pub fn new(entity_type: impl Into<String>, field_name: impl Into<String>, extractor: ValueExtractor) -> Self {
        Self {
            entity_type: entity_type.into(),
            field_name: field_name.into(),
            extractor,
            normalizer: None,
        }
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    fn extract_normalized(&self, bytes: &[u8]) -> Option<String> {
        let raw = (self.extractor)(bytes)?;
        if raw.is_empty() {
            return None;
        }
        Some(match &self.normalizer {
            Some(n) => n(&raw),
            None => raw,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Three-state failure isolator: closed → open after N consecutive
/// failures → half-open after a cooldown, probing a single call → closed on
/// success, open again on failure.
struct CircuitBreaker {
    state: Mutex<BreakerState>,
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            config,
        }
    }

    /// Returns `true` if a call may proceed (closed, or half-open allowing
    /// exactly one probe through).
    fn allow_call(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self.opened_at.lock().map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state != BreakerState::Closed {
            info!("constraint substrate circuit breaker closed");
        }
        *state = BreakerState::Closed;
        *self.opened_at.lock() = None;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        if *state == BreakerState::HalfOpen {
            *state = BreakerState::Open;
            *self.opened_at.lock() = Some(Instant::now());
            warn!("constraint substrate probe failed, circuit breaker re-opened");
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.max_failures && *state == BreakerState::Closed {
            *state = BreakerState::Open;
            *self.opened_at.lock() = Some(Instant::now());
            warn!(failures, "constraint substrate circuit breaker opened");
        }
    }
}

/// Atomic uniqueness over `(entity, field, normalized-value) -> object_key`.
/// Backed by a set-if-absent map; `DashMap::entry` gives us that primitive
/// in-process without a separate substrate trait (unlike `MultiIndex`, this
/// component has no meaningful "absent substrate" degraded mode — a
/// constraint we cannot check must not be silently skipped).
pub struct ConstraintManager {
    constraints: DashMap<String, Vec<UniqueConstraint>>,
    claims: DashMap<String, ObjectKey>,
    breaker: CircuitBreaker,
}

impl ConstraintManager {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            constraints: DashMap::new(),
            claims: DashMap::new(),
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    pub fn register(&self, constraint: UniqueConstraint) {
        self.constraints
            .entry(constraint.entity_type.clone())
            .or_default()
            .push(constraint);
    }

    fn claim_key(entity: &str, field: &str, value: &str) -> String {
        format!("unique:{entity}:{field}:{value}")
    }

    fn constraints_for(&self, entity: &str) -> Vec<UniqueConstraint> {
        self.constraints.get(entity).map(|v| v.clone()).unwrap_or_default()
    }

    fn try_set_if_absent(&self, claim_key: &str, owner: &ObjectKey) -> Option<ObjectKey> {
        match self.claims.entry(claim_key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(owner.clone());
                None
            }
            dashmap::mapref::entry::Entry::Occupied(o) => Some(o.get().clone()),
        }
    }

    pub fn claim_unique(&self, entity: &str, object_key: &ObjectKey, doc: &[u8]) -> EngineResult<Vec<String>> {
        if !self.breaker.allow_call() {
            return Err(EngineError::backend_unavailable(
                "constraint circuit breaker open",
            ));
        }

        let mut claimed = Vec::new();
        for constraint in self.constraints_for(entity) {
            let Some(value) = constraint.extract_normalized(doc) else {
                continue;
            };
            let claim_key = Self::claim_key(entity, &constraint.field_name, &value);
            match self.try_set_if_absent(&claim_key, object_key) {
                None => claimed.push(claim_key),
                Some(existing_owner) if existing_owner == *object_key => {
                    claimed.push(claim_key);
                }
                Some(existing_owner) => {
                    for key in &claimed {
                        self.claims.remove(key);
                    }
                    self.breaker.record_success();
                    return Err(EngineError::constraint_violation(
                        entity,
                        &constraint.field_name,
                        value,
                        Some(existing_owner.into_string()),
                    ));
                }
            }
        }
        self.breaker.record_success();
        Ok(claimed)
    }

    pub fn update_unique(
        &self,
        entity: &str,
        object_key: &ObjectKey,
        old_doc: Option<&[u8]>,
        new_doc: &[u8],
    ) -> EngineResult<Vec<String>> {
        let old_keys: Vec<String> = old_doc
            .map(|doc| {
                self.constraints_for(entity)
                    .into_iter()
                    .filter_map(|c| {
                        c.extract_normalized(doc)
                            .map(|v| Self::claim_key(entity, &c.field_name, &v))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for key in &old_keys {
            self.claims.remove(key);
        }

        match self.claim_unique(entity, object_key, new_doc) {
            Ok(claimed) => Ok(claimed),
            Err(err) => {
                for key in &old_keys {
                    if self.try_set_if_absent(key, object_key).is_some() {
                        warn!(claim_key = key, "failed to restore old constraint claim on update rollback");
                    }
                }
                Err(err)
            }
        }
    }

    pub fn release(&self, keys: &[String]) {
        for key in keys {
            self.claims.remove(key);
        }
    }

    pub fn release_by_doc(&self, entity: &str, doc: &[u8]) {
        let keys: Vec<String> = self
            .constraints_for(entity)
            .into_iter()
            .filter_map(|c| {
                c.extract_normalized(doc)
                    .map(|v| Self::claim_key(entity, &c.field_name, &v))
            })
            .collect();
        self.release(&keys);
    }

    /// Re-derives all claims for `entity` from scratch. Used after
    /// registering a new constraint or recovering from substrate data loss.
    pub fn rebuild_constraints(&self, entity: &str, objects: &[(ObjectKey, Vec<u8>)]) -> EngineResult<()> {
        let prefix = format!("unique:{entity}:");
        self.claims.retain(|k, _| !k.starts_with(&prefix));
        for (key, doc) in objects {
            self.claim_unique(entity, key, doc)?;
        }
        Ok(())
    }
}
