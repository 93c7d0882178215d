use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::debug;

use crate::digest::Digest;
use crate::error::{StoreError, StoreResult};
use crate::traits::{validate_segment, ArtifactKey, ArtifactRef, ArtifactStore, RunId};

/// Filesystem-backed artifact store with git-style 2-char sharding.
///
/// Layout:
/// - `<root>/objects/<first 2 hex chars>/<remaining hex chars>`: blob bytes
/// - `<root>/runs/<run id>/<stage>/<name>`: hex digest of the blob
///
/// Blobs and index entries are both written to a temp file in the target
/// directory and renamed into place, so readers never see partial content.
///
/// Blob collection in `purge_run` holds the store's gc lock exclusively;
/// every other operation holds it shared. A `put` that reuses an existing
/// blob therefore always has its index entry on disk before a purge can
/// decide that blob is dead.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    layout: Layout,
    gc: Arc<RwLock<()>>,
}

#[derive(Debug, Clone)]
struct Layout {
    objects_dir: PathBuf,
    runs_dir: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`. Creates `objects/` and `runs/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let layout = Layout {
            objects_dir: root.join("objects"),
            runs_dir: root.join("runs"),
        };
        fs::create_dir_all(&layout.objects_dir)?;
        fs::create_dir_all(&layout.runs_dir)?;
        Ok(Self {
            layout,
            gc: Arc::new(RwLock::new(())),
        })
    }

    /// Run `f` on the blocking pool while holding the gc lock shared.
    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> StoreResult<T> + Send + 'static,
    {
        let guard = self.gc.clone().read_owned().await;
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(&layout)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(ErrorKind::Other, e)))?
    }

    /// Like [`Self::blocking`], but excludes every other operation.
    async fn exclusive<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> StoreResult<T> + Send + 'static,
    {
        let guard = self.gc.clone().write_owned().await;
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(&layout)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(ErrorKind::Other, e)))?
    }
}

impl Layout {
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn run_dir(&self, run_id: &RunId) -> StoreResult<PathBuf> {
        validate_segment(run_id.as_str())?;
        Ok(self.runs_dir.join(run_id.as_str()))
    }

    fn index_path(&self, run_id: &RunId, key: &ArtifactKey) -> StoreResult<PathBuf> {
        Ok(self.run_dir(run_id)?.join(key.stage()).join(key.name()))
    }

    fn write_blob(&self, digest: &Digest, data: &[u8]) -> StoreResult<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        let shard_dir = shard_parent(&path)?;
        fs::create_dir_all(shard_dir)?;

        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_index(&self, run_id: &RunId, key: &ArtifactKey) -> StoreResult<ArtifactRef> {
        let path = self.index_path(run_id, key)?;
        let hex = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound {
                    run_id: run_id.clone(),
                    key: key.clone(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        let digest: Digest = hex.trim().parse()?;
        let size = fs::metadata(self.blob_path(&digest))?.len();
        Ok(ArtifactRef {
            run_id: run_id.clone(),
            key: key.clone(),
            digest,
            size,
        })
    }

    fn put(&self, run_id: &RunId, key: &ArtifactKey, data: &[u8]) -> StoreResult<ArtifactRef> {
        let digest = Digest::compute(data);
        let index_path = self.index_path(run_id, key)?;

        if index_path.exists() {
            return self.check_existing(run_id, key, digest);
        }

        self.write_blob(&digest, data)?;

        let stage_dir = shard_parent(&index_path)?;
        fs::create_dir_all(stage_dir)?;
        let mut tmp = NamedTempFile::new_in(stage_dir)?;
        tmp.write_all(digest.to_hex().as_bytes())?;
        if let Err(e) = tmp.persist_noclobber(&index_path) {
            if e.error.kind() == ErrorKind::AlreadyExists {
                // A concurrent writer won the race for this key.
                return self.check_existing(run_id, key, digest);
            }
            return Err(StoreError::Io(e.error));
        }

        debug!(run_id = %run_id, key = %key, digest = %digest.short(), "artifact written");
        Ok(ArtifactRef {
            run_id: run_id.clone(),
            key: key.clone(),
            digest,
            size: data.len() as u64,
        })
    }

    fn check_existing(
        &self,
        run_id: &RunId,
        key: &ArtifactKey,
        digest: Digest,
    ) -> StoreResult<ArtifactRef> {
        let existing = self.read_index(run_id, key)?;
        if existing.digest == digest {
            Ok(existing)
        } else {
            Err(StoreError::Immutable {
                run_id: run_id.clone(),
                key: key.clone(),
                existing: existing.digest.to_hex(),
            })
        }
    }

    fn get(&self, artifact: &ArtifactRef) -> StoreResult<Vec<u8>> {
        let indexed = self.read_index(&artifact.run_id, &artifact.key)?;
        if indexed.digest != artifact.digest {
            return Err(StoreError::NotFound {
                run_id: artifact.run_id.clone(),
                key: artifact.key.clone(),
            });
        }
        let data = fs::read(self.blob_path(&indexed.digest))?;
        let actual = Digest::compute(&data);
        if actual != indexed.digest {
            return Err(StoreError::Corrupt {
                expected: indexed.digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(data)
    }

    fn list(&self, run_id: &RunId) -> StoreResult<Vec<ArtifactRef>> {
        let run_dir = self.run_dir(run_id)?;
        if !run_dir.exists() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        for stage_entry in fs::read_dir(&run_dir)? {
            let stage_entry = stage_entry?;
            if !stage_entry.file_type()?.is_dir() {
                continue;
            }
            let stage = stage_entry.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(stage_entry.path())? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                // Skip in-flight temp files.
                let Ok(key) = ArtifactKey::new(stage.clone(), name) else {
                    continue;
                };
                refs.push(self.read_index(run_id, &key)?);
            }
        }
        refs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(refs)
    }

    fn purge_run(&self, run_id: &RunId) -> StoreResult<usize> {
        let doomed = self.list(run_id)?;
        if doomed.is_empty() {
            return Ok(0);
        }
        fs::remove_dir_all(self.run_dir(run_id)?)?;

        let mut live = std::collections::HashSet::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let other = RunId(entry?.file_name().to_string_lossy().into_owned());
            for artifact in self.list(&other)? {
                live.insert(artifact.digest);
            }
        }
        for artifact in &doomed {
            if live.contains(&artifact.digest) {
                continue;
            }
            match fs::remove_file(self.blob_path(&artifact.digest)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        Ok(doomed.len())
    }
}

fn shard_parent(path: &Path) -> StoreResult<&Path> {
    path.parent().ok_or_else(|| {
        StoreError::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("path has no parent: {}", path.display()),
        ))
    })
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        run_id: &RunId,
        key: &ArtifactKey,
        blob: &[u8],
    ) -> StoreResult<ArtifactRef> {
        let (run_id, key, blob) = (run_id.clone(), key.clone(), blob.to_vec());
        self.blocking(move |layout| layout.put(&run_id, &key, &blob))
            .await
    }

    async fn get(&self, artifact: &ArtifactRef) -> StoreResult<Vec<u8>> {
        let artifact = artifact.clone();
        self.blocking(move |layout| layout.get(&artifact)).await
    }

    async fn resolve(&self, run_id: &RunId, key: &ArtifactKey) -> StoreResult<ArtifactRef> {
        let (run_id, key) = (run_id.clone(), key.clone());
        self.blocking(move |layout| layout.read_index(&run_id, &key))
            .await
    }

    async fn list(&self, run_id: &RunId) -> StoreResult<Vec<ArtifactRef>> {
        let run_id = run_id.clone();
        self.blocking(move |layout| layout.list(&run_id)).await
    }

    async fn purge_run(&self, run_id: &RunId) -> StoreResult<usize> {
        let run_id = run_id.clone();
        self.exclusive(move |layout| layout.purge_run(&run_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn key(stage: &str, name: &str) -> ArtifactKey {
        ArtifactKey::new(stage, name).unwrap()
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let (_dir, store) = make_store();
        let run = RunId::new();
        let artifact = store
            .put(&run, &key("synth", "assembly"), b"hello world")
            .await
            .unwrap();
        assert_eq!(artifact.size, 11);
        assert_eq!(store.get(&artifact).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn identical_blobs_share_one_object() {
        let (dir, store) = make_store();
        let run = RunId::new();
        let a = store.put(&run, &key("synth", "a"), b"dup").await.unwrap();
        let b = store.put(&run, &key("synth", "b"), b"dup").await.unwrap();
        assert_eq!(a.digest, b.digest);

        let hex = a.digest.to_hex();
        let shard = dir.path().join("objects").join(&hex[..2]);
        let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn large_blob() {
        let (_dir, store) = make_store();
        let run = RunId::new();
        let data = vec![0xABu8; 1_100_000];
        let artifact = store.put(&run, &key("synth", "big"), &data).await.unwrap();
        assert_eq!(store.get(&artifact).await.unwrap(), data);
    }

    #[tokio::test]
    async fn corrupt_blob_is_detected() {
        let (dir, store) = make_store();
        let run = RunId::new();
        let artifact = store.put(&run, &key("synth", "a"), b"intact").await.unwrap();

        let hex = artifact.digest.to_hex();
        let path = dir.path().join("objects").join(&hex[..2]).join(&hex[2..]);
        std::fs::write(path, b"tampered").unwrap();

        match store.get(&artifact).await {
            Err(StoreError::Corrupt { expected, .. }) => assert_eq!(expected, hex),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunId::new();
        let artifact = {
            let store = FsArtifactStore::new(dir.path()).unwrap();
            store.put(&run, &key("synth", "a"), b"persisted").await.unwrap()
        };
        let reopened = FsArtifactStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get(&artifact).await.unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn purge_removes_unshared_objects_only() {
        let (dir, store) = make_store();
        let run_a = RunId::new();
        let run_b = RunId::new();
        let only_a = store.put(&run_a, &key("s", "x"), b"only a").await.unwrap();
        store.put(&run_a, &key("s", "y"), b"shared").await.unwrap();
        let shared_b = store.put(&run_b, &key("s", "y"), b"shared").await.unwrap();

        assert_eq!(store.purge_run(&run_a).await.unwrap(), 2);
        assert!(!dir.path().join("runs").join(run_a.as_str()).exists());
        assert_eq!(store.get(&shared_b).await.unwrap(), b"shared");

        let hex = only_a.digest.to_hex();
        assert!(!dir.path().join("objects").join(&hex[..2]).join(&hex[2..]).exists());
    }

    #[tokio::test]
    async fn run_id_must_be_a_plain_segment() {
        let (_dir, store) = make_store();
        let err = store
            .put(&RunId("../escape".to_string()), &key("s", "x"), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
