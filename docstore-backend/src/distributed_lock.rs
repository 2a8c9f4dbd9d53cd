// ABOUTME: Optional cross-process lease primitive, orthogonal to the in-process StripedLocks
// ABOUTME: A FilesystemBackend has no use for this; remote backends may implement it

use crate::error::BackendResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An acquired lease. Dropping it does not release the lease — callers must
/// call [`LeaseGuard::release`] explicitly so release failures are visible.
#[async_trait]
pub trait LeaseGuard: Send + Sync {
    async fn release(self: Box<Self>) -> BackendResult<()>;

    /// Extends the lease's expiry by `ttl` from now. Implementations should
    /// fail rather than silently no-op if the lease already expired.
    async fn renew(&self, ttl: Duration) -> BackendResult<()>;
}

/// Cross-process mutual exclusion over a named resource. Backed by whatever
/// coordination primitive the underlying store offers (a lock file with an
/// advisory flock, a conditional row in a remote store, etc).
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Blocks until the lease is acquired or `cancel` fires.
    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> BackendResult<Box<dyn LeaseGuard>>;

    /// Attempts to acquire without blocking; `Ok(None)` means the resource is
    /// currently held by someone else.
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> BackendResult<Option<Box<dyn LeaseGuard>>>;
}
