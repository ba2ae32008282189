//! On-disk cache layout and filesystem primitives.
//!
//! Layout under the configured root:
//!
//! ```text
//! {root}/{registry_name}/[{scope}/]{name}/.cache.json
//! {root}/{registry_name}/[{scope}/]{name}/{version}/package.tgz
//! ```
//!
//! Writes land in a uniquely named sibling temp file and are renamed into
//! place, so readers only ever observe complete files.  Concurrent writers
//! to the same location do not coordinate; the last rename wins.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::registry::{PackageIdentity, TarballRequest};

const METADATA_FILE: &str = ".cache.json";
const TARBALL_FILE: &str = "package.tgz";

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Maps package identities to cache files and performs the file I/O.
#[derive(Debug, Clone)]
pub struct CacheStore {
    /// Root directory of the cache (e.g. `/var/cache/npmcache`).
    pub base_path: PathBuf,
    /// Namespace directory for this registry.
    pub registry_name: String,
}

impl CacheStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            base_path: PathBuf::from(&config.path),
            registry_name: config.registry_name.clone(),
        }
    }

    /// `{root}/{registry}/[{scope}/]{name}`
    fn package_dir(&self, identity: &PackageIdentity) -> PathBuf {
        let mut dir = self.base_path.join(&self.registry_name);
        if let Some(scope) = identity.scope() {
            dir.push(scope);
        }
        dir.push(identity.name());
        dir
    }

    /// Location of the cached metadata document for `identity`.
    pub fn metadata_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.package_dir(identity).join(METADATA_FILE)
    }

    /// Location of the cached tarball for `request`.
    pub fn tarball_path(&self, request: &TarballRequest) -> PathBuf {
        self.package_dir(&request.identity)
            .join(&request.version)
            .join(TARBALL_FILE)
    }

    /// Whether a regular file exists at `path`.
    pub async fn exists(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache existence check failed");
                false
            }
        }
    }

    /// Read a cached file as UTF-8 text.
    pub async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read cache file {}", path.display()))
    }

    /// Open a cached file for streaming, returning it with its length.
    pub async fn open(&self, path: &Path) -> Result<(tokio::fs::File, u64)> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open cache file {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat cache file {}", path.display()))?
            .len();
        Ok((file, len))
    }
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Sibling temp path unique to this writer.
fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent dirs for {}", path.display()))?;
    }
    Ok(())
}

async fn commit(tmp_path: &Path, path: &Path) -> Result<()> {
    tokio::fs::rename(tmp_path, path)
        .await
        .with_context(|| format!("rename {} → {}", tmp_path.display(), path.display()))?;
    debug!(path = %path.display(), "cache file written");
    Ok(())
}

/// Write `contents` to `path` via temp file + rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent(path).await?;
    let tmp_path = temp_path_for(path);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        file.write_all(contents)
            .await
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        file.flush().await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    commit(&tmp_path, path).await
}

/// Drain `stream` into `path` via temp file + rename.  A failed chunk or
/// write discards the partial temp file.
pub async fn write_stream_atomic<S>(path: &Path, stream: S) -> Result<()>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    ensure_parent(path).await?;
    let tmp_path = temp_path_for(path);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("upstream body stream failed")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        }
        file.flush().await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    commit(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> CacheStore {
        CacheStore {
            base_path: root.to_path_buf(),
            registry_name: "namespace".to_string(),
        }
    }

    #[test]
    fn unscoped_metadata_path() {
        let s = store(Path::new("/root"));
        let id = PackageIdentity::unscoped("left-pad").unwrap();
        assert_eq!(
            s.metadata_path(&id),
            PathBuf::from("/root/namespace/left-pad/.cache.json")
        );
    }

    #[test]
    fn scoped_metadata_path() {
        let s = store(Path::new("/root"));
        let id = PackageIdentity::scoped("@myorg", "mylib").unwrap();
        assert_eq!(
            s.metadata_path(&id),
            PathBuf::from("/root/namespace/@myorg/mylib/.cache.json")
        );
    }

    #[test]
    fn tarball_paths() {
        let s = store(Path::new("/root"));
        let id = PackageIdentity::unscoped("left-pad").unwrap();
        let req = TarballRequest::from_filename(id, "left-pad-1.3.0.tgz").unwrap();
        assert_eq!(
            s.tarball_path(&req),
            PathBuf::from("/root/namespace/left-pad/1.3.0/package.tgz")
        );

        let id = PackageIdentity::scoped("@myorg", "mylib").unwrap();
        let req = TarballRequest::from_filename(id, "mylib-2.0.0.tgz").unwrap();
        assert_eq!(
            s.tarball_path(&req),
            PathBuf::from("/root/namespace/@myorg/mylib/2.0.0/package.tgz")
        );
    }

    #[tokio::test]
    async fn write_then_read_and_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let id = PackageIdentity::unscoped("left-pad").unwrap();
        let path = s.metadata_path(&id);

        assert!(!s.exists(&path).await);
        write_atomic(&path, b"{\"name\":\"left-pad\"}").await.unwrap();
        assert!(s.exists(&path).await);
        assert_eq!(s.read(&path).await.unwrap(), "{\"name\":\"left-pad\"}");

        let (_file, len) = s.open(&path).await.unwrap();
        assert_eq!(len, 19);
    }

    #[tokio::test]
    async fn directories_do_not_count_as_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        assert!(!s.exists(tmp.path()).await);
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        assert!(s.read(&tmp.path().join("absent")).await.is_err());
        assert!(s.open(&tmp.path().join("absent")).await.is_err());
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pkg/1.0.0/package.tgz");
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ]);

        assert!(write_stream_atomic(&path, chunks).await.is_err());
        assert!(!path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn stream_write_replaces_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pkg/.cache.json");
        write_atomic(&path, b"old").await.unwrap();

        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ne")),
            Ok(Bytes::from_static(b"w")),
        ]);
        write_stream_atomic(&path, chunks).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}
