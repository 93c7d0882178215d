//! Promote-Store: artifact persistence for promote pipelines
//!
//! Artifacts are the blobs one stage hands to a later stage (source snapshots,
//! synthesized deployment assemblies). Every artifact is addressed twice:
//!
//! - by content, through a SHA-256 [`Digest`] over its bytes
//! - by key, through an [`ArtifactKey`] (`<producing stage>/<name>`) scoped to
//!   a single [`RunId`]
//!
//! Keys never leak across runs, and a key once written is immutable for the
//! lifetime of its run. Blobs are removed only when a run is purged
//! explicitly.
//!
//! ## Backends
//!
//! - [`MemoryArtifactStore`]: process-local, used by tests and one-shot runs
//! - [`FsArtifactStore`]: git-style sharded object directory with atomic writes

mod digest;
mod error;
pub mod fs;
pub mod memory;
pub mod traits;

pub use digest::Digest;
pub use error::{StoreError, StoreResult};
pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;
pub use traits::{ArtifactKey, ArtifactRef, ArtifactStore, RunId};
