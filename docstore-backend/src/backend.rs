// ABOUTME: The abstract byte-level object-store contract every storage implementation honors
// ABOUTME: `put_if_match` is the sole concurrency primitive exposed to higher layers

use crate::error::BackendResult;
use crate::key::{ObjectKey, VersionToken};
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Callback invoked once per page by [`Backend::list_paginated`]. Returning
/// `false` stops pagination early.
pub type PageCallback<'a> = Box<dyn FnMut(Vec<ObjectKey>) -> bool + Send + 'a>;

/// Abstract byte-level object store. A single narrow contract permits
/// filesystem, remote-object-store, and encryption-wrapping implementations
/// to sit behind it interchangeably.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &ObjectKey, cancel: &CancellationToken) -> BackendResult<Vec<u8>>;

    async fn put(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    async fn delete(&self, key: &ObjectKey, cancel: &CancellationToken) -> BackendResult<()>;

    async fn exists(&self, key: &ObjectKey, cancel: &CancellationToken) -> BackendResult<bool>;

    async fn get_with_version(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> BackendResult<(Vec<u8>, VersionToken)>;

    /// Compare-and-swap write. An empty `expected` token means unconditional.
    async fn put_if_match(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        expected: &VersionToken,
        cancel: &CancellationToken,
    ) -> BackendResult<VersionToken>;

    async fn list(&self, prefix: &str, cancel: &CancellationToken) -> BackendResult<Vec<ObjectKey>>;

    /// Emits fixed-size batches of keys under `prefix` via `batch_fn`. The
    /// callback may return `false` to stop early.
    async fn list_paginated(
        &self,
        prefix: &str,
        batch_size: usize,
        batch_fn: PageCallback<'_>,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    async fn get_stream(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> BackendResult<Pin<Box<dyn AsyncRead + Send>>>;

    async fn put_stream(
        &self,
        key: &ObjectKey,
        reader: Pin<Box<dyn AsyncRead + Send>>,
        size_hint: Option<u64>,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    /// Appends `bytes` to `key`, atomic against concurrent appenders on the
    /// same backend instance.
    async fn append(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    async fn ping(&self, cancel: &CancellationToken) -> BackendResult<()>;
}

/// Marker for implementors that also expose a writable stream sink,
/// satisfying the `put_stream` signature above without forcing every caller
/// to import `tokio::io::AsyncWrite` directly.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
