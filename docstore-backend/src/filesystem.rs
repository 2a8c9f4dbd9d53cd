// ABOUTME: Concrete Backend over a local directory tree
// ABOUTME: Atomic writes via temp-file + rename, hex-MD5 version tokens, striped per-key locking

use crate::backend::{Backend, PageCallback};
use crate::error::{BackendError, BackendResult};
use crate::key::{ObjectKey, VersionToken};
use crate::locks::StripedLocks;
use async_trait::async_trait;
use md5::{Digest, Md5};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tuning knobs for [`FilesystemBackend`]. Matches the `filesystem.*` and
/// `stripe_count` / `batch.page_size` entries of the engine configuration
/// surface.
#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    pub stripe_count: usize,
    pub file_perms: u32,
    pub dir_perms: u32,
    pub default_page_size: usize,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            stripe_count: 32,
            file_perms: 0o644,
            dir_perms: 0o755,
            default_page_size: 100,
        }
    }
}

/// Filesystem-backed [`Backend`]. `{base}/{key}` is the path layout; a
/// key's forward slashes map directly to directory separators.
pub struct FilesystemBackend {
    base: PathBuf,
    locks: StripedLocks,
    config: FilesystemConfig,
}

impl FilesystemBackend {
    pub fn new(base: impl Into<PathBuf>, config: FilesystemConfig) -> Self {
        Self {
            base: base.into(),
            locks: StripedLocks::new(config.stripe_count),
            config,
        }
    }

    fn path_for(&self, key: &ObjectKey) -> PathBuf {
        self.base.join(key.as_str())
    }

    async fn ensure_parent_dir(&self, path: &Path) -> BackendResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(self.config.dir_perms);
                let _ = fs::set_permissions(parent, perms).await;
            }
        }
        Ok(())
    }

    /// Writes `bytes` to `path` via a same-directory temp file followed by
    /// an fsync-then-rename, so a reader observes either the pre- or
    /// post-write image, never a partial one (I1).
    async fn atomic_write(&self, path: &Path, bytes: &[u8]) -> BackendResult<()> {
        self.ensure_parent_dir(path).await?;
        let suffix: u64 = rand::thread_rng().gen();
        let tmp_path = path.with_extension(format!("tmp-{suffix:x}"));

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(self.config.file_perms);
            let _ = fs::set_permissions(&tmp_path, perms).await;
        }

        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    fn hash_bytes(bytes: &[u8]) -> VersionToken {
        let digest = Md5::digest(bytes);
        VersionToken::new(hex::encode(digest))
    }

    async fn read_current(&self, path: &Path) -> BackendResult<Option<(Vec<u8>, VersionToken)>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let token = Self::hash_bytes(&bytes);
                Ok(Some((bytes, token)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    async fn get(&self, key: &ObjectKey, _cancel: &CancellationToken) -> BackendResult<Vec<u8>> {
        let path = self.path_for(key);
        fs::read(&path).await.map_err(|err| {
            BackendError::from(err).with_context("key", key.as_str())
        })
    }

    async fn put(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        _cancel: &CancellationToken,
    ) -> BackendResult<()> {
        let path = self.path_for(key);
        let _guard = self.locks.lock(key.as_str());
        self.atomic_write(&path, &bytes).await?;
        debug!(key = key.as_str(), bytes = bytes.len(), "put");
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey, _cancel: &CancellationToken) -> BackendResult<()> {
        let path = self.path_for(key);
        let _guard = self.locks.lock(key.as_str());
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BackendError::not_found(key.as_str())),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &ObjectKey, _cancel: &CancellationToken) -> BackendResult<bool> {
        Ok(fs::metadata(self.path_for(key)).await.is_ok())
    }

    async fn get_with_version(
        &self,
        key: &ObjectKey,
        _cancel: &CancellationToken,
    ) -> BackendResult<(Vec<u8>, VersionToken)> {
        let path = self.path_for(key);
        let _guard = self.locks.rlock(key.as_str());
        match self.read_current(&path).await? {
            Some(pair) => Ok(pair),
            None => Err(BackendError::not_found(key.as_str())),
        }
    }

    async fn put_if_match(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        expected: &VersionToken,
        _cancel: &CancellationToken,
    ) -> BackendResult<VersionToken> {
        let path = self.path_for(key);
        // The write-stripe closes the check-then-write window; without it
        // two racing writers could both observe a match and both "win".
        let _guard = self.locks.lock(key.as_str());

        if !expected.is_unconditional() {
            let current = self.read_current(&path).await?;
            let observed = match &current {
                Some((_, token)) => token.clone(),
                None => VersionToken::unconditional(),
            };
            if observed != *expected {
                return Err(BackendError::Conflict {
                    key: key.as_str().to_string(),
                    expected: expected.as_str().to_string(),
                    observed: observed.as_str().to_string(),
                    context: Default::default(),
                });
            }
        }

        self.atomic_write(&path, &bytes).await?;
        Ok(Self::hash_bytes(&bytes))
    }

    async fn list(&self, prefix: &str, cancel: &CancellationToken) -> BackendResult<Vec<ObjectKey>> {
        let mut all = Vec::new();
        self.list_paginated(
            prefix,
            self.config.default_page_size,
            Box::new(|batch| {
                all.extend(batch);
                true
            }),
            cancel,
        )
        .await?;
        Ok(all)
    }

    async fn list_paginated(
        &self,
        prefix: &str,
        batch_size: usize,
        mut batch_fn: PageCallback<'_>,
        _cancel: &CancellationToken,
    ) -> BackendResult<()> {
        let root = self.base.join(prefix);
        let mut stack = vec![root.clone()];
        let mut batch = Vec::with_capacity(batch_size);

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.base) else {
                    continue;
                };
                let Some(rel_str) = rel.to_str() else { continue };
                let Ok(key) = ObjectKey::parse(rel_str.replace('\\', "/")) else {
                    continue;
                };
                batch.push(key);
                if batch.len() >= batch_size {
                    if !batch_fn(std::mem::take(&mut batch)) {
                        return Ok(());
                    }
                }
            }
        }
        if !batch.is_empty() && !batch_fn(batch) {
            return Ok(());
        }
        Ok(())
    }

    async fn get_stream(
        &self,
        key: &ObjectKey,
        _cancel: &CancellationToken,
    ) -> BackendResult<Pin<Box<dyn AsyncRead + Send>>> {
        let path = self.path_for(key);
        let file = fs::File::open(&path).await.map_err(BackendError::from)?;
        Ok(Box::pin(file))
    }

    async fn put_stream(
        &self,
        key: &ObjectKey,
        mut reader: Pin<Box<dyn AsyncRead + Send>>,
        _size_hint: Option<u64>,
        _cancel: &CancellationToken,
    ) -> BackendResult<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.map_err(BackendError::from)?;
        self.put(key, bytes, _cancel).await
    }

    async fn append(&self, key: &ObjectKey, bytes: Vec<u8>, _cancel: &CancellationToken) -> BackendResult<()> {
        let path = self.path_for(key);
        let _guard = self.locks.lock(key.as_str());
        self.ensure_parent_dir(&path).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn ping(&self, _cancel: &CancellationToken) -> BackendResult<()> {
        fs::create_dir_all(&self.base).await?;
        let probe = self.base.join(format!(".ping-{:x}", rand::thread_rng().gen::<u64>()));
        match fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = fs::remove_file(&probe).await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "backend ping failed");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_bytes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), FilesystemConfig::default());
        let key = ObjectKey::parse("users/a.json").unwrap();

        backend.put(&key, b"hello".to_vec(), &cancel()).await.unwrap();
        let got = backend.get(&key, &cancel()).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn put_if_match_rejects_stale_token() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), FilesystemConfig::default());
        let key = ObjectKey::parse("users/a.json").unwrap();

        let t1 = backend
            .put_if_match(&key, b"v1".to_vec(), &VersionToken::unconditional(), &cancel())
            .await
            .unwrap();
        let result = backend
            .put_if_match(&key, b"v2".to_vec(), &VersionToken::unconditional(), &cancel())
            .await;
        assert!(result.is_ok(), "unconditional write always succeeds");

        let result = backend
            .put_if_match(&key, b"v3".to_vec(), &t1, &cancel())
            .await;
        assert!(matches!(result, Err(BackendError::Conflict { .. })));
    }

    #[tokio::test]
    async fn version_token_changes_iff_bytes_change() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), FilesystemConfig::default());
        let key = ObjectKey::parse("users/a.json").unwrap();

        let t1 = backend
            .put_if_match(&key, b"same".to_vec(), &VersionToken::unconditional(), &cancel())
            .await
            .unwrap();
        let (_, t2) = backend.get_with_version(&key, &cancel()).await.unwrap();
        assert_eq!(t1, t2);
    }

    #[tokio::test]
    async fn delete_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), FilesystemConfig::default());
        let key = ObjectKey::parse("users/missing.json").unwrap();
        let result = backend.delete(&key, &cancel()).await;
        assert!(matches!(result, Err(BackendError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_paginated_finds_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), FilesystemConfig::default());
        for id in ["a", "b", "c"] {
            let key = ObjectKey::parse(format!("users/{id}.json")).unwrap();
            backend.put(&key, b"{}".to_vec(), &cancel()).await.unwrap();
        }
        let keys = backend.list("users/", &cancel()).await.unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_appends_preserve_both_writes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(FilesystemBackend::new(dir.path(), FilesystemConfig::default()));
        let key = ObjectKey::parse("log/events.ndjson").unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let backend = backend.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .append(&key, format!("line-{i}\n").into_bytes(), &CancellationToken::new())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let bytes = backend.get(&key, &cancel()).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 10);
    }
}
