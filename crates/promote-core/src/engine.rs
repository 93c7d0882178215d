//! Pipeline engine: drives one run to completion.
//!
//! Stages run strictly in declaration order; a stage starts only after the
//! previous one succeeded. Inside a stage, actions run grouped by run order:
//! a group is launched together and awaited jointly, and the stage fails if
//! any member fails. The first failure halts the pipeline. Nothing is rolled
//! back; the deployer is idempotent, so re-running a revision rolls forward.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use promote_store::{ArtifactKey, ArtifactRef, ArtifactStore, RunId, StoreError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn, Instrument};

use crate::approval::{ApprovalBoard, Verdict};
use crate::deploy::{DeployArtifact, DeployRequest, EnvironmentDeployer, EnvironmentEndpoint};
use crate::error::{ActionError, FailureCause};
use crate::journal::{EventKind, Journal};
use crate::model::{Action, ActionSpec, Contact, Identity, OutputRef, Revision, StageId, StageStatus};
use crate::notify::Notifier;
use crate::obs;
use crate::pipeline::{Pipeline, PipelineResult, RunStatus};
use crate::runner::{CommandOutput, CommandRunner};

/// Engine tunables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Limit for each test or build command. `None` waits indefinitely.
    pub command_timeout: Option<Duration>,
    /// Limit for each approval gate. An expired gate is rejected on behalf of
    /// [`TIMEOUT_ACTOR`](crate::TIMEOUT_ACTOR). `None` waits indefinitely.
    pub approval_timeout: Option<Duration>,
}

/// Executes pipelines against injected collaborators.
#[derive(Clone)]
pub struct PipelineEngine {
    deployer: Arc<dyn EnvironmentDeployer>,
    runner: Arc<dyn CommandRunner>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

/// Successful result of one action.
enum ActionOutcome {
    Deployed(EnvironmentEndpoint),
    Built(ArtifactRef),
    Tested,
    Approved(Verdict),
}

enum StageOutcome {
    Succeeded,
    Failed,
    Rejected,
    Cancelled,
}

/// Approval action fields needed to open its gate.
struct ApprovalRequest<'a> {
    action: &'a str,
    approvers: &'a BTreeSet<Identity>,
    notify: &'a BTreeSet<Contact>,
    note: Option<&'a str>,
}

/// Read-only view shared by the actions of one run-order group.
struct ActionContext<'a> {
    run_id: &'a RunId,
    revision: &'a Revision,
    stage: &'a StageId,
    environment: &'a str,
    artifacts: &'a Arc<dyn ArtifactStore>,
    outputs: &'a BTreeMap<OutputRef, EnvironmentEndpoint>,
}

impl PipelineEngine {
    pub fn new(
        deployer: Arc<dyn EnvironmentDeployer>,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            deployer,
            runner,
            notifier,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `pipeline` to completion, first failure, rejection or cancellation.
    ///
    /// Action failures never surface as `Err`; they are recorded on their
    /// stage and summarized in the returned [`PipelineResult`].
    pub async fn run(&self, pipeline: Pipeline) -> PipelineResult {
        let span = obs::run_span(pipeline.run_id().as_str());
        self.execute(pipeline).instrument(span).await
    }

    async fn execute(&self, mut pipeline: Pipeline) -> PipelineResult {
        let started = Instant::now();
        let controls = pipeline.controls();
        let mut cancel = controls.cancel_signal();
        let mut journal = Journal::new();
        let mut outputs = BTreeMap::new();

        journal.record(EventKind::RunStarted {
            revision: pipeline.revision.clone(),
        });
        obs::emit_run_started(
            pipeline.run_id().as_str(),
            pipeline.revision.as_str(),
            pipeline.stages.len(),
        );

        let mut status = RunStatus::Succeeded;
        for idx in 0..pipeline.stages.len() {
            if *cancel.borrow() {
                status = RunStatus::Cancelled;
                break;
            }
            let outcome = self
                .run_stage(&mut pipeline, idx, &mut outputs, &mut journal, &mut cancel)
                .await;
            match outcome {
                StageOutcome::Succeeded => {}
                StageOutcome::Failed => {
                    status = RunStatus::Failed;
                    break;
                }
                StageOutcome::Rejected => {
                    status = RunStatus::Rejected;
                    break;
                }
                StageOutcome::Cancelled => {
                    status = RunStatus::Cancelled;
                    break;
                }
            }
        }

        if status == RunStatus::Cancelled {
            abort_run(&mut pipeline, &mut journal);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_run_finished(pipeline.run_id().as_str(), status.as_str(), duration_ms);

        let first_failure = pipeline.stages.iter().find_map(|s| s.failure.clone());
        PipelineResult {
            pipeline: pipeline.name,
            run_id: controls.run_id().clone(),
            revision: pipeline.revision,
            topology_digest: pipeline.topology_digest,
            status,
            stages: pipeline.stages,
            first_failure,
            journal: journal.into_events(),
            duration_ms,
        }
    }

    async fn run_stage(
        &self,
        pipeline: &mut Pipeline,
        idx: usize,
        outputs: &mut BTreeMap<OutputRef, EnvironmentEndpoint>,
        journal: &mut Journal,
        cancel: &mut watch::Receiver<bool>,
    ) -> StageOutcome {
        let stage_id = pipeline.stages[idx].id.clone();
        let environment = pipeline.stages[idx].environment.clone();
        let groups: Vec<(u32, Vec<Action>)> = pipeline.stages[idx]
            .run_order_groups()
            .into_iter()
            .map(|(order, actions)| (order, actions.into_iter().cloned().collect()))
            .collect();

        {
            let stage = &mut pipeline.stages[idx];
            stage.status = StageStatus::Running;
            stage.started_at = Some(Utc::now());
        }
        pipeline.controls.publish(&pipeline.stages);
        journal.record(EventKind::StageStarted {
            stage: stage_id.clone(),
        });
        obs::emit_stage_started(&stage_id, &environment);

        for (run_order, group) in groups {
            if *cancel.borrow() {
                return StageOutcome::Cancelled;
            }
            debug!(stage = %stage_id, run_order = run_order, actions = group.len(), "starting run-order group");

            for action in &group {
                journal.record(EventKind::ActionStarted {
                    stage: stage_id.clone(),
                    action: action.name.clone(),
                });
            }

            let mut gate = None;
            for action in &group {
                if let ActionSpec::Approval {
                    approvers,
                    notify,
                    note,
                } = &action.spec
                {
                    let request = ApprovalRequest {
                        action: &action.name,
                        approvers,
                        notify,
                        note: note.as_deref(),
                    };
                    gate = Some(self.request_approval(pipeline, idx, request, journal).await);
                }
            }

            let ctx = ActionContext {
                run_id: pipeline.controls.run_id(),
                revision: &pipeline.revision,
                stage: &stage_id,
                environment: &environment,
                artifacts: &pipeline.artifacts,
                outputs: &*outputs,
            };
            let ctx = &ctx;
            let approvals = pipeline.controls.approvals();
            let launched: Vec<_> = group
                .iter()
                .map(move |action| {
                    let receiver = if action.spec.is_approval() {
                        gate.take()
                    } else {
                        None
                    };
                    self.execute_action(ctx, approvals, action, receiver)
                })
                .collect();

            let results = tokio::select! {
                results = join_all(launched) => results,
                _ = cancelled(cancel) => return StageOutcome::Cancelled,
            };

            let mut failed: Option<bool> = None;
            for (action, result) in group.iter().zip(results) {
                match result {
                    Ok(outcome) => {
                        journal.record(EventKind::ActionSucceeded {
                            stage: stage_id.clone(),
                            action: action.name.clone(),
                        });
                        self.apply_outcome(pipeline, idx, action, outcome, outputs, journal);
                    }
                    Err(error) => {
                        obs::emit_action_failed(&stage_id, &action.name, &error);
                        journal.record(EventKind::ActionFailed {
                            stage: stage_id.clone(),
                            action: action.name.clone(),
                            kind: error.kind(),
                            message: error.to_string(),
                        });
                        let stage = &mut pipeline.stages[idx];
                        if let ActionError::Rejected { verdict } = &error {
                            record_verdict(journal, &stage_id, verdict);
                            stage.approval = Some(verdict.clone());
                        }
                        if failed.is_none() {
                            failed = Some(matches!(error, ActionError::Rejected { .. }));
                            stage.failure =
                                Some(FailureCause::from_error(&stage_id, &action.name, &error));
                        }
                    }
                }
            }

            if let Some(rejected) = failed {
                let status = if rejected {
                    StageStatus::Rejected
                } else {
                    StageStatus::Failed
                };
                self.finish_stage(pipeline, idx, status, journal);
                return if rejected {
                    StageOutcome::Rejected
                } else {
                    StageOutcome::Failed
                };
            }
            pipeline.controls.publish(&pipeline.stages);
        }

        self.finish_stage(pipeline, idx, StageStatus::Succeeded, journal);
        StageOutcome::Succeeded
    }

    /// Open the stage's gate, move it to `AwaitingApproval` and notify contacts.
    async fn request_approval(
        &self,
        pipeline: &mut Pipeline,
        idx: usize,
        request: ApprovalRequest<'_>,
        journal: &mut Journal,
    ) -> oneshot::Receiver<Verdict> {
        let stage_id = pipeline.stages[idx].id.clone();

        let receiver = pipeline
            .controls
            .approvals()
            .open(&stage_id, request.approvers.clone(), request.note.map(str::to_string));
        pipeline.stages[idx].status = StageStatus::AwaitingApproval;
        pipeline.controls.publish(&pipeline.stages);
        journal.record(EventKind::ApprovalRequested {
            stage: stage_id.clone(),
            action: request.action.to_string(),
        });
        obs::emit_approval_requested(&stage_id, request.approvers.len());

        let mut message = format!(
            "Approval required to promote revision {} to stage {} (run {})",
            pipeline.revision, stage_id, pipeline.controls.run_id()
        );
        if let Some(note) = request.note {
            message.push_str(": ");
            message.push_str(note);
        }
        for contact in request.notify {
            if let Err(e) = self.notifier.notify(contact, &message).await {
                warn!(stage = %stage_id, contact = %contact, error = %e, "approval notification failed");
                journal.record(EventKind::NotificationFailed {
                    stage: stage_id.clone(),
                    contact: contact.to_string(),
                    error: e.to_string(),
                });
            }
        }
        receiver
    }

    async fn execute_action(
        &self,
        ctx: &ActionContext<'_>,
        approvals: &ApprovalBoard,
        action: &Action,
        gate: Option<oneshot::Receiver<Verdict>>,
    ) -> Result<ActionOutcome, ActionError> {
        match &action.spec {
            ActionSpec::Deploy { artifact } => self
                .deploy(ctx, &action.name, artifact.as_ref())
                .await
                .map(ActionOutcome::Deployed),
            ActionSpec::Test { command, outputs } => {
                let mut env = BTreeMap::from([
                    ("PROMOTE_STAGE".to_string(), ctx.stage.to_string()),
                    ("PROMOTE_ENVIRONMENT".to_string(), ctx.environment.to_string()),
                    ("PROMOTE_REVISION".to_string(), ctx.revision.to_string()),
                ]);
                for (var, reference) in outputs {
                    let endpoint =
                        ctx.outputs
                            .get(reference)
                            .ok_or_else(|| ActionError::MissingOutput {
                                reference: reference.to_string(),
                            })?;
                    env.insert(var.clone(), endpoint.to_string());
                }
                let output = self
                    .run_command(command, &env)
                    .await
                    .map_err(|cause| ActionError::TestFailed {
                        cause,
                        output: String::new(),
                    })?;
                if !output.passed() {
                    return Err(ActionError::TestFailed {
                        cause: format!("exit code {}", output.exit_code),
                        output: output.combined(),
                    });
                }
                Ok(ActionOutcome::Tested)
            }
            ActionSpec::Build { command, output } => {
                let env = BTreeMap::from([
                    ("PROMOTE_STAGE".to_string(), ctx.stage.to_string()),
                    ("PROMOTE_REVISION".to_string(), ctx.revision.to_string()),
                ]);
                let result = self
                    .run_command(command, &env)
                    .await
                    .map_err(|cause| ActionError::BuildFailed {
                        cause,
                        output: String::new(),
                    })?;
                if !result.passed() {
                    return Err(ActionError::BuildFailed {
                        cause: format!("exit code {}", result.exit_code),
                        output: result.combined(),
                    });
                }
                let key = ArtifactKey::new(ctx.stage.as_str(), output.as_str())?;
                let stored = ctx
                    .artifacts
                    .put(ctx.run_id, &key, result.stdout.as_bytes())
                    .await?;
                debug!(artifact = %key, digest = %stored.digest.short(), size = stored.size, "build output stored");
                Ok(ActionOutcome::Built(stored))
            }
            ActionSpec::Approval { .. } => {
                let receiver = gate.ok_or(ActionError::GateClosed)?;
                let verdict = self.await_verdict(approvals, ctx.stage, receiver).await?;
                if verdict.is_approved() {
                    Ok(ActionOutcome::Approved(verdict))
                } else {
                    Err(ActionError::Rejected { verdict })
                }
            }
        }
    }

    async fn deploy(
        &self,
        ctx: &ActionContext<'_>,
        action: &str,
        artifact: Option<&ArtifactKey>,
    ) -> Result<EnvironmentEndpoint, ActionError> {
        let artifact = match artifact {
            Some(key) => {
                let stored = ctx
                    .artifacts
                    .resolve(ctx.run_id, key)
                    .await
                    .map_err(|e| match e {
                        StoreError::NotFound { .. } => {
                            ActionError::ArtifactNotFound { key: key.clone() }
                        }
                        other => ActionError::Store(other),
                    })?;
                let bytes = ctx.artifacts.get(&stored).await?;
                Some(DeployArtifact {
                    key: key.clone(),
                    bytes,
                })
            }
            None => None,
        };

        let request = DeployRequest {
            run_id: ctx.run_id.clone(),
            stage: ctx.stage.clone(),
            action: action.to_string(),
            environment: ctx.environment.to_string(),
            revision: ctx.revision.clone(),
            artifact,
        };
        let endpoint = self
            .deployer
            .deploy(&request)
            .await
            .map_err(|cause| ActionError::DeploymentFailed { cause })?;
        info!(stage = %ctx.stage, action = %action, endpoint = %endpoint, "environment deployed");
        Ok(endpoint)
    }

    /// Run a command under the configured timeout. `Err` carries the reason it
    /// produced no exit status.
    async fn run_command(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, String> {
        let invocation = self.runner.run(command, env);
        let result = match self.config.command_timeout {
            Some(limit) => tokio::time::timeout(limit, invocation)
                .await
                .map_err(|_| format!("timed out after {}s", limit.as_secs()))?,
            None => invocation.await,
        };
        result.map_err(|e| format!("could not run command: {e}"))
    }

    async fn await_verdict(
        &self,
        approvals: &ApprovalBoard,
        stage: &StageId,
        receiver: oneshot::Receiver<Verdict>,
    ) -> Result<Verdict, ActionError> {
        match self.config.approval_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(verdict) => verdict.map_err(|_| ActionError::GateClosed),
                Err(_) => {
                    warn!(stage = %stage, timeout_secs = limit.as_secs(), "approval timed out");
                    approvals
                        .expire(stage, limit.as_secs())
                        .ok_or(ActionError::GateClosed)
                }
            },
            None => receiver.await.map_err(|_| ActionError::GateClosed),
        }
    }

    fn apply_outcome(
        &self,
        pipeline: &mut Pipeline,
        idx: usize,
        action: &Action,
        outcome: ActionOutcome,
        outputs: &mut BTreeMap<OutputRef, EnvironmentEndpoint>,
        journal: &mut Journal,
    ) {
        let stage = &mut pipeline.stages[idx];
        match outcome {
            ActionOutcome::Deployed(endpoint) => {
                outputs.insert(
                    OutputRef::new(stage.id.clone(), action.name.clone()),
                    endpoint.clone(),
                );
                stage.outputs.insert(action.name.clone(), endpoint);
            }
            ActionOutcome::Built(stored) => stage.artifacts.push(stored),
            ActionOutcome::Tested => {}
            ActionOutcome::Approved(verdict) => {
                record_verdict(journal, &stage.id, &verdict);
                stage.approval = Some(verdict);
                stage.status = StageStatus::Approved;
            }
        }
    }

    fn finish_stage(
        &self,
        pipeline: &mut Pipeline,
        idx: usize,
        status: StageStatus,
        journal: &mut Journal,
    ) {
        let stage = &mut pipeline.stages[idx];
        stage.status = status;
        stage.finished_at = Some(Utc::now());
        obs::emit_stage_finished(&stage.id, status, stage.duration_ms().unwrap_or(0));
        journal.record(EventKind::StageFinished {
            stage: stage.id.clone(),
            status,
        });
        pipeline.controls.publish(&pipeline.stages);
    }
}

fn record_verdict(journal: &mut Journal, stage: &StageId, verdict: &Verdict) {
    obs::emit_approval_resolved(stage, &verdict.decision.to_string(), verdict.actor.as_str());
    journal.record(EventKind::ApprovalResolved {
        stage: stage.clone(),
        decision: verdict.decision,
        actor: verdict.actor.to_string(),
    });
}

/// Resolves once the run is cancelled. Never resolves if the cancel switch is gone.
async fn cancelled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Withdraw open gates and move every non-terminal stage to `Cancelled`.
fn abort_run(pipeline: &mut Pipeline, journal: &mut Journal) {
    pipeline.controls.approvals().withdraw_all();
    let now = Utc::now();
    for stage in pipeline.stages.iter_mut().filter(|s| !s.status.is_terminal()) {
        let started = stage.started_at.is_some();
        stage.status = StageStatus::Cancelled;
        if started {
            stage.finished_at = Some(now);
            journal.record(EventKind::StageFinished {
                stage: stage.id.clone(),
                status: StageStatus::Cancelled,
            });
        }
    }
    journal.record(EventKind::RunCancelled);
    warn!(run_id = %pipeline.controls.run_id(), "pipeline run cancelled");
    pipeline.controls.publish(&pipeline.stages);
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
