//! Entry point: builds a pipeline from a topology and runs it.

use std::sync::Arc;

use promote_store::{ArtifactStore, RunId, StoreResult};
use tokio::task::{JoinError, JoinHandle};
use tracing::info;

use crate::approval::{ApprovalBoard, Resolution, Verdict};
use crate::engine::PipelineEngine;
use crate::error::ApprovalError;
use crate::model::{Revision, StageStatus};
use crate::pipeline::{Pipeline, PipelineResult, RunControls, RunSnapshot};
use crate::topology::Topology;

/// Owns the engine and the artifact store shared by every run it starts.
#[derive(Clone)]
pub struct Orchestrator {
    engine: PipelineEngine,
    artifacts: Arc<dyn ArtifactStore>,
}

impl Orchestrator {
    pub fn new(engine: PipelineEngine, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { engine, artifacts }
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Instantiate a pipeline for `revision` without running it.
    pub fn prepare(&self, topology: &Topology, revision: Revision) -> Pipeline {
        Pipeline::new(topology, revision, Arc::clone(&self.artifacts))
    }

    /// Start a run on its own task and return a handle to steer it.
    pub fn start(&self, topology: &Topology, revision: Revision) -> RunHandle {
        let pipeline = self.prepare(topology, revision);
        let controls = pipeline.controls();
        info!(
            pipeline = %topology.name(),
            run_id = %controls.run_id(),
            digest = %topology.digest(),
            "starting pipeline run"
        );
        let engine = self.engine.clone();
        let task = tokio::spawn(async move { engine.run(pipeline).await });
        RunHandle { controls, task }
    }

    /// Run to completion on the current task. Approval gates can only be
    /// resolved through the returned pipeline's controls, so use
    /// [`start`](Self::start) for topologies with approvals.
    pub async fn run(&self, topology: &Topology, revision: Revision) -> PipelineResult {
        self.engine.run(self.prepare(topology, revision)).await
    }

    /// Remove every artifact of `run_id`. Returns how many were removed.
    pub async fn cleanup(&self, run_id: &RunId) -> StoreResult<usize> {
        let removed = self.artifacts.purge_run(run_id).await?;
        info!(run_id = %run_id, removed = removed, "run artifacts purged");
        Ok(removed)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// Handle to a run started with [`Orchestrator::start`].
#[derive(Debug)]
pub struct RunHandle {
    controls: RunControls,
    task: JoinHandle<PipelineResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        self.controls.run_id()
    }

    pub fn controls(&self) -> &RunControls {
        &self.controls
    }

    pub fn approvals(&self) -> &ApprovalBoard {
        self.controls.approvals()
    }

    /// Resolve an approval gate of this run.
    pub fn resolve(&self, resolution: Resolution) -> Result<Verdict, ApprovalError> {
        self.controls.approvals().resolve(resolution)
    }

    pub fn cancel(&self) {
        self.controls.cancel();
    }

    /// Latest status of every stage.
    pub fn status(&self) -> RunSnapshot {
        self.controls.status()
    }

    /// Wait until `stage` reports `status`. Returns `false` if the run ended
    /// without ever reaching it.
    pub async fn wait_for_status(&self, stage: &str, status: StageStatus) -> bool {
        let mut updates = self.controls.subscribe();
        loop {
            {
                let snapshot = updates.borrow_and_update();
                if snapshot.status_of(stage) == Some(status) {
                    return true;
                }
                if snapshot.is_finished() {
                    return false;
                }
            }
            if updates.changed().await.is_err() {
                return false;
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<PipelineResult, JoinError> {
        self.task.await
    }

    /// Wait for the run to end without consuming the handle.
    pub async fn finished(&mut self) -> Result<PipelineResult, JoinError> {
        (&mut self.task).await
    }
}
