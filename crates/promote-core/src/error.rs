//! Error taxonomy for the pipeline engine.
//!
//! Action-level errors ([`ActionError`]) always fail their stage; they are
//! reported in the [`PipelineResult`](crate::PipelineResult), never returned
//! from `run`. [`ApprovalError`] and [`TopologyError`] are returned
//! synchronously to the caller and leave all state untouched.

use promote_store::{ArtifactKey, StoreError};
use serde::{Deserialize, Serialize};

use crate::approval::Verdict;
use crate::model::StageId;

/// Failure reported by an [`EnvironmentDeployer`](crate::EnvironmentDeployer).
#[derive(Debug, Clone, thiserror::Error)]
#[error("provisioning failed: {cause}")]
pub struct ProvisionError {
    pub cause: String,
}

impl ProvisionError {
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

/// Errors produced while executing a single action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("deployment failed: {cause}")]
    DeploymentFailed { cause: ProvisionError },

    #[error("test failed: {cause}")]
    TestFailed { cause: String, output: String },

    #[error("build failed: {cause}")]
    BuildFailed { cause: String, output: String },

    #[error("artifact not found: {key}")]
    ArtifactNotFound { key: ArtifactKey },

    #[error("output not available: {reference}")]
    MissingOutput { reference: String },

    #[error("rejected by {}", .verdict.actor)]
    Rejected { verdict: Verdict },

    #[error("approval gate closed before a decision was recorded")]
    GateClosed,

    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),
}

impl ActionError {
    /// Stable classification used in reports and the journal.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DeploymentFailed { .. } => FailureKind::DeploymentFailed,
            Self::TestFailed { .. } => FailureKind::TestFailed,
            Self::BuildFailed { .. } => FailureKind::BuildFailed,
            Self::ArtifactNotFound { .. } => FailureKind::ArtifactNotFound,
            Self::MissingOutput { .. } => FailureKind::MissingOutput,
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::GateClosed => FailureKind::GateClosed,
            Self::Store(_) => FailureKind::Store,
        }
    }

    /// Output captured from a failed command, kept for diagnostics.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::TestFailed { output, .. } | Self::BuildFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DeploymentFailed,
    TestFailed,
    BuildFailed,
    ArtifactNotFound,
    MissingOutput,
    Rejected,
    GateClosed,
    Store,
}

/// First failure of a stage, as recorded in the pipeline result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub stage: StageId,
    pub action: String,
    pub kind: FailureKind,
    pub message: String,
    /// Captured command output, for test and build failures.
    pub output: Option<String>,
}

impl FailureCause {
    pub fn from_error(stage: &StageId, action: &str, error: &ActionError) -> Self {
        Self {
            stage: stage.clone(),
            action: action.to_string(),
            kind: error.kind(),
            message: error.to_string(),
            output: error.captured_output().map(str::to_string),
        }
    }
}

/// Errors on the approval resolution interface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("no stage awaiting approval: {0}")]
    UnknownStage(StageId),

    #[error("approval for stage {0} already resolved")]
    AlreadyResolved(StageId),

    #[error("{actor} is not an approver for stage {stage}")]
    UnauthorizedActor { stage: StageId, actor: String },
}

/// Errors found while building a topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error("invalid name {0:?}: use letters, digits, '-' or '_'")]
    InvalidName(String),

    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("stage {0} has no actions")]
    EmptyStage(String),

    #[error("duplicate action {action} in stage {stage}")]
    DuplicateAction { stage: String, action: String },

    #[error("stage {0} declares more than one approval action")]
    MultipleApprovals(String),

    #[error("run order must be at least 1 (stage {stage}, action {action})")]
    InvalidRunOrder { stage: String, action: String },

    #[error("action {action} in stage {stage} has an empty command")]
    EmptyCommand { stage: String, action: String },

    #[error("invalid output reference {0:?}: expected <stage>.<action>")]
    InvalidOutputRef(String),

    #[error("action {action} in stage {stage} uses output {reference}, which no earlier deploy produces")]
    UnresolvedOutput {
        stage: String,
        action: String,
        reference: String,
    },

    #[error("action {action} in stage {stage} consumes artifact {key}, which no earlier build produces")]
    UnresolvedArtifact {
        stage: String,
        action: String,
        key: String,
    },

    #[error("invalid artifact key: {0}")]
    InvalidArtifact(#[from] StoreError),

    #[error("failed to parse topology: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read topology: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_keeps_captured_output() {
        let err = ActionError::TestFailed {
            cause: "exit code 1".to_string(),
            output: "1 failing".to_string(),
        };
        let cause = FailureCause::from_error(&StageId::new("dev"), "integration", &err);
        assert_eq!(cause.kind, FailureKind::TestFailed);
        assert_eq!(cause.output.as_deref(), Some("1 failing"));
        assert!(cause.message.contains("exit code 1"));
    }

    #[test]
    fn deployment_failure_wraps_provision_error() {
        let err = ActionError::DeploymentFailed {
            cause: ProvisionError::new("quota exceeded"),
        };
        assert_eq!(err.kind(), FailureKind::DeploymentFailed);
        assert!(err.to_string().contains("quota exceeded"));
        assert!(err.captured_output().is_none());
    }

    #[test]
    fn approval_error_display() {
        let err = ApprovalError::AlreadyResolved(StageId::new("prod"));
        assert!(err.to_string().contains("prod"));
        let err = ApprovalError::UnauthorizedActor {
            stage: StageId::new("prod"),
            actor: "mallory".to_string(),
        };
        assert!(err.to_string().contains("mallory"));
    }
}
