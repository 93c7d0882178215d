//! Promote Core Library
//!
//! A multi-stage deployment pipeline engine: a revision is promoted through
//! an ordered list of stages, each bound to one environment, with approval
//! gates between them and a halt on the first failure.
//!
//! ```text
//! Topology ──► Orchestrator ──► PipelineEngine ──► EnvironmentDeployer
//!                   │                 │        └─► CommandRunner (tests, builds)
//!                   │                 └─► ApprovalBoard ◄── operators
//!                   └─► ArtifactStore
//! ```
//!
//! Collaborators are injected as trait objects; [`fakes`] provides recording
//! in-memory versions for tests.

pub mod approval;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod journal;
pub mod model;
pub mod notify;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod runner;
pub mod telemetry;
pub mod topology;

pub use approval::{
    ApprovalBoard, Decision, PendingApproval, Resolution, Verdict, TIMEOUT_ACTOR,
};
pub use deploy::{
    CommandDeployer, DeployArtifact, DeployRequest, EnvironmentDeployer, EnvironmentEndpoint,
};
pub use engine::{EngineConfig, PipelineEngine};
pub use error::{
    ActionError, ApprovalError, FailureCause, FailureKind, ProvisionError, TopologyError,
};
pub use journal::{EventKind, Journal, PipelineEvent};
pub use model::{
    Action, ActionSpec, Contact, Identity, OutputRef, Revision, Stage, StageId, StageStatus,
};
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::{Orchestrator, RunHandle};
pub use pipeline::{
    Pipeline, PipelineResult, RunControls, RunSnapshot, RunStatus, StageSnapshot,
};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use topology::{ActionDef, StageDef, StagePlan, Topology};

pub use promote_store::{
    ArtifactKey, ArtifactRef, ArtifactStore, FsArtifactStore, MemoryArtifactStore, RunId,
    StoreError,
};

/// Promote version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
