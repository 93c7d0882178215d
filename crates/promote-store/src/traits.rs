//! Artifact store trait and the identifiers it works with.
//!
//! - `RunId`: one pipeline run; the scope of every key
//! - `ArtifactKey`: `<producing stage>/<name>`
//! - `ArtifactRef`: a written artifact (run + key + content digest)
//!
//! All methods are async and backend-agnostic.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{StoreError, StoreResult};

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an artifact, qualified by the stage that produced it.
///
/// Both segments must be plain path components: non-empty, no `/` or `\`,
/// and not starting with `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ArtifactKey {
    stage: String,
    name: String,
}

impl ArtifactKey {
    pub fn new(stage: impl Into<String>, name: impl Into<String>) -> StoreResult<Self> {
        let stage = stage.into();
        let name = name.into();
        validate_segment(&stage)?;
        validate_segment(&name)?;
        Ok(Self { stage, name })
    }

    /// Stage that produced the artifact.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub(crate) fn validate_segment(segment: &str) -> StoreResult<()> {
    if segment.is_empty()
        || segment.starts_with('.')
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(StoreError::InvalidKey(segment.to_string()));
    }
    Ok(())
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.name)
    }
}

impl FromStr for ArtifactKey {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        let (stage, name) = s
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidKey(s.to_string()))?;
        Self::new(stage, name)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = StoreError;

    fn try_from(s: String) -> StoreResult<Self> {
        s.parse()
    }
}

/// Handle to a written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: RunId,
    pub key: ArtifactKey,
    pub digest: Digest,
    /// Blob length in bytes
    pub size: u64,
}

/// Run-scoped, content-addressed artifact store.
///
/// Guarantees:
/// - `put` of an existing key with identical bytes returns the same ref;
///   with different bytes it fails with `StoreError::Immutable`.
/// - `get` after a successful `put` returns the identical bytes.
/// - No partial write is ever observable through `get`.
/// - Nothing is removed except by `purge_run`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `blob` under `key` for `run_id`.
    async fn put(&self, run_id: &RunId, key: &ArtifactKey, blob: &[u8])
        -> StoreResult<ArtifactRef>;

    /// Retrieve the bytes of a written artifact. Returns `StoreError::NotFound`
    /// if the run no longer indexes it.
    async fn get(&self, artifact: &ArtifactRef) -> StoreResult<Vec<u8>>;

    /// Look up the ref written under `key` in `run_id`.
    async fn resolve(&self, run_id: &RunId, key: &ArtifactKey) -> StoreResult<ArtifactRef>;

    /// All artifacts written in `run_id`, ordered by key.
    async fn list(&self, run_id: &RunId) -> StoreResult<Vec<ArtifactRef>>;

    /// Drop every artifact of `run_id`. Returns how many keys were removed.
    async fn purge_run(&self, run_id: &RunId) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_and_display() {
        let key: ArtifactKey = "synth/assembly".parse().unwrap();
        assert_eq!(key.stage(), "synth");
        assert_eq!(key.name(), "assembly");
        assert_eq!(key.to_string(), "synth/assembly");
    }

    #[test]
    fn key_rejects_path_tricks() {
        assert!(ArtifactKey::new("", "x").is_err());
        assert!(ArtifactKey::new("dev", "..").is_err());
        assert!(ArtifactKey::new("dev", "a/b").is_err());
        assert!(ArtifactKey::new(".hidden", "x").is_err());
        assert!("no-separator".parse::<ArtifactKey>().is_err());
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
