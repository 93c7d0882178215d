//! One pipeline run: its stages, shared controls and final result.

use std::sync::Arc;

use promote_store::{ArtifactStore, RunId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::approval::ApprovalBoard;
use crate::deploy::EnvironmentEndpoint;
use crate::error::FailureCause;
use crate::journal::PipelineEvent;
use crate::model::{Revision, Stage, StageId, StageStatus};
use crate::topology::Topology;

/// Status of one stage in a [`RunSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub id: StageId,
    pub status: StageStatus,
}

/// Point-in-time view of every stage's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSnapshot {
    pub stages: Vec<StageSnapshot>,
}

impl RunSnapshot {
    pub(crate) fn of(stages: &[Stage]) -> Self {
        Self {
            stages: stages
                .iter()
                .map(|s| StageSnapshot {
                    id: s.id.clone(),
                    status: s.status,
                })
                .collect(),
        }
    }

    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|s| s.id.as_str() == stage)
            .map(|s| s.status)
    }

    /// Whether the run has ended: every stage succeeded, or one stopped it.
    pub fn is_finished(&self) -> bool {
        self.stages.iter().all(|s| s.status == StageStatus::Succeeded)
            || self.stages.iter().any(|s| {
                matches!(
                    s.status,
                    StageStatus::Failed | StageStatus::Rejected | StageStatus::Cancelled
                )
            })
    }
}

/// Handles shared between the engine and the outside world while a run is in
/// flight: the approval board, the cancel switch and the live status feed.
#[derive(Debug, Clone)]
pub struct RunControls {
    run_id: RunId,
    approvals: ApprovalBoard,
    cancel: Arc<watch::Sender<bool>>,
    status: Arc<watch::Sender<RunSnapshot>>,
}

impl RunControls {
    fn new(run_id: RunId, initial: RunSnapshot) -> Self {
        let (cancel, _) = watch::channel(false);
        let (status, _) = watch::channel(initial);
        Self {
            run_id,
            approvals: ApprovalBoard::new(),
            cancel: Arc::new(cancel),
            status: Arc::new(status),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn approvals(&self) -> &ApprovalBoard {
        &self.approvals
    }

    /// Abort the run. No further deploy, test or build actions start; actions
    /// in flight are abandoned and every non-terminal stage ends `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Latest stage statuses.
    pub fn status(&self) -> RunSnapshot {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.status.subscribe()
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub(crate) fn publish(&self, stages: &[Stage]) {
        self.status.send_replace(RunSnapshot::of(stages));
    }
}

/// A pipeline instantiated from a topology for one revision.
///
/// Created once per run and consumed by [`PipelineEngine::run`](crate::PipelineEngine::run).
pub struct Pipeline {
    pub(crate) name: String,
    pub(crate) topology_digest: String,
    pub(crate) revision: Revision,
    pub(crate) stages: Vec<Stage>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) controls: RunControls,
}

impl Pipeline {
    pub fn new(topology: &Topology, revision: Revision, artifacts: Arc<dyn ArtifactStore>) -> Self {
        let stages: Vec<Stage> = topology
            .stages()
            .iter()
            .map(|plan| Stage::new(plan.id.clone(), plan.environment.clone(), plan.actions.clone()))
            .collect();
        let controls = RunControls::new(RunId::new(), RunSnapshot::of(&stages));
        Self {
            name: topology.name().to_string(),
            topology_digest: topology.digest().to_string(),
            revision,
            stages,
            artifacts,
            controls,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> &RunId {
        self.controls.run_id()
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn controls(&self) -> RunControls {
        self.controls.clone()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("run_id", self.run_id())
            .field("revision", &self.revision)
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Rejected,
    Cancelled,
}

impl RunStatus {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Rejected => 2,
            Self::Cancelled => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a finished run. Every stage is listed with its final status.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub run_id: RunId,
    pub revision: Revision,
    pub topology_digest: String,
    pub status: RunStatus,
    pub stages: Vec<Stage>,
    /// First failure, in stage then declaration order.
    pub first_failure: Option<FailureCause>,
    pub journal: Vec<PipelineEvent>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id.as_str() == name)
    }

    pub fn status_of(&self, name: &str) -> Option<StageStatus> {
        self.stage(name).map(|s| s.status)
    }

    /// Endpoint produced by deploy action `action` of stage `stage`.
    pub fn endpoint(&self, stage: &str, action: &str) -> Option<&EnvironmentEndpoint> {
        self.stage(stage).and_then(|s| s.outputs.get(action))
    }

    pub fn passed_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Succeeded)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.status, StageStatus::Failed | StageStatus::Rejected))
            .count()
    }
}
