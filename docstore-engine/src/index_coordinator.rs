// ABOUTME: The single legal Create/Update/Delete mutation pipeline
// ABOUTME: Each step returns an explicit StepOutcome so compensation is never silently skipped

use crate::constraint_manager::ConstraintManager;
use crate::error::{EngineError, EngineResult};
use crate::multi_index::MultiIndex;
use crate::store::Store;
use docstore_backend::ObjectKey;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Outcome of one pipeline step. `Compensate` carries the action the driving
/// loop must take before propagating the error, so a future refactor cannot
/// accidentally drop a rollback behind a bare `?`.
enum StepOutcome<T> {
    Proceed(T),
    Compensate(EngineError),
}

/// Non-owning references to the collaborators a mutation sequences across;
/// construct once and share across coordinator calls.
pub struct IndexCoordinator<'a> {
    pub store: &'a Store,
    pub index: &'a MultiIndex,
    pub constraints: &'a ConstraintManager,
}

impl<'a> IndexCoordinator<'a> {
    pub fn new(store: &'a Store, index: &'a MultiIndex, constraints: &'a ConstraintManager) -> Self {
        Self { store, index, constraints }
    }

    /// `Create`: claim unique fields, write the document, update the index.
    /// Index-update failure after a successful write is logged, not fatal —
    /// `HealthMonitor` repairs it (I3).
    pub async fn create(&self, key: &ObjectKey, entity: &str, doc: Vec<u8>, cancel: &CancellationToken) -> EngineResult<()> {
        let claimed = match self.try_claim(entity, key, &doc) {
            StepOutcome::Proceed(claimed) => claimed,
            StepOutcome::Compensate(err) => return Err(err),
        };

        if let Err(err) = self.store.backend().put(key, doc.clone(), cancel).await {
            self.constraints.release(&claimed);
            return Err(err.into());
        }

        self.index.update(key, &doc);
        Ok(())
    }

    fn try_claim(&self, entity: &str, key: &ObjectKey, doc: &[u8]) -> StepOutcome<Vec<String>> {
        match self.constraints.claim_unique(entity, key, doc) {
            Ok(claimed) => StepOutcome::Proceed(claimed),
            Err(err) => StepOutcome::Compensate(err),
        }
    }

    /// `Update`: release stale claims and claim new ones, write the new
    /// document, replace index entries.
    pub async fn update(
        &self,
        key: &ObjectKey,
        entity: &str,
        new_doc: Vec<u8>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let old_bytes = match self.store.backend().get(key, cancel).await {
            Ok(bytes) => Some(bytes),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        let new_claims = self
            .constraints
            .update_unique(entity, key, old_bytes.as_deref(), &new_doc)?;

        if let Err(err) = self.store.backend().put(key, new_doc.clone(), cancel).await {
            self.constraints.release(&new_claims);
            return Err(err.into());
        }

        self.index.replace(key, old_bytes.as_deref(), Some(&new_doc));
        Ok(())
    }

    /// `Delete`: remove from index, release claims, then delete bytes. This
    /// ordering means a crash after step 1 or 2 leaves stale index/claim
    /// state (repairable) rather than an index entry pointing at nothing.
    pub async fn delete(&self, key: &ObjectKey, entity: &str, cancel: &CancellationToken) -> EngineResult<()> {
        let bytes = match self.store.backend().get(key, cancel).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => return Err(EngineError::not_found(key.as_str())),
            Err(err) => return Err(err.into()),
        };

        self.index.remove(key, &bytes);
        self.constraints.release_by_doc(entity, &bytes);

        if let Err(err) = self.store.backend().delete(key, cancel).await {
            warn!(key = key.as_str(), error = %err, "delete failed after index/claims released; indexes may be stale until repair");
            return Err(err.into());
        }
        Ok(())
    }
}
