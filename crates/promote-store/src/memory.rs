//! In-memory artifact store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::digest::Digest;
use crate::error::{StoreError, StoreResult};
use crate::traits::{ArtifactKey, ArtifactRef, ArtifactStore, RunId};

#[derive(Debug, Default)]
struct Inner {
    /// Per-run key index.
    runs: HashMap<RunId, BTreeMap<ArtifactKey, ArtifactRef>>,
    /// Deduplicated blobs, shared by every run that wrote the same bytes.
    blobs: HashMap<Digest, Arc<Vec<u8>>>,
}

impl Inner {
    fn is_referenced(&self, digest: &Digest) -> bool {
        self.runs
            .values()
            .any(|index| index.values().any(|r| &r.digest == digest))
    }
}

/// Artifact store backed by a `HashMap` behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    inner: Mutex<Inner>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held (after deduplication).
    pub fn blob_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blobs
            .len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        run_id: &RunId,
        key: &ArtifactKey,
        blob: &[u8],
    ) -> StoreResult<ArtifactRef> {
        let digest = Digest::compute(blob);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inner.runs.get(run_id).and_then(|index| index.get(key)) {
            if existing.digest == digest {
                return Ok(existing.clone());
            }
            return Err(StoreError::Immutable {
                run_id: run_id.clone(),
                key: key.clone(),
                existing: existing.digest.to_hex(),
            });
        }

        inner
            .blobs
            .entry(digest)
            .or_insert_with(|| Arc::new(blob.to_vec()));
        let artifact = ArtifactRef {
            run_id: run_id.clone(),
            key: key.clone(),
            digest,
            size: blob.len() as u64,
        };
        inner
            .runs
            .entry(run_id.clone())
            .or_default()
            .insert(key.clone(), artifact.clone());
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> StoreResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let indexed = inner
            .runs
            .get(&artifact.run_id)
            .and_then(|index| index.get(&artifact.key))
            .filter(|r| r.digest == artifact.digest);
        indexed
            .and_then(|r| inner.blobs.get(&r.digest))
            .map(|blob| blob.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound {
                run_id: artifact.run_id.clone(),
                key: artifact.key.clone(),
            })
    }

    async fn resolve(&self, run_id: &RunId, key: &ArtifactKey) -> StoreResult<ArtifactRef> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .runs
            .get(run_id)
            .and_then(|index| index.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.clone(),
                key: key.clone(),
            })
    }

    async fn list(&self, run_id: &RunId) -> StoreResult<Vec<ArtifactRef>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .runs
            .get(run_id)
            .map(|index| index.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn purge_run(&self, run_id: &RunId) -> StoreResult<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = inner.runs.remove(run_id) else {
            return Ok(0);
        };
        for artifact in index.values() {
            if !inner.is_referenced(&artifact.digest) {
                inner.blobs.remove(&artifact.digest);
            }
        }
        Ok(index.len())
    }
}
