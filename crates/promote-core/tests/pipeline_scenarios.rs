//! End-to-end pipeline runs against the recording fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promote_core::fakes::{RecordingDeployer, RecordingNotifier, ScriptedCommandRunner};
use promote_core::{
    ActionDef, ApprovalError, ArtifactKey, ArtifactRef, ArtifactStore, EngineConfig, EventKind,
    FailureKind, MemoryArtifactStore, Orchestrator, OutputRef, PipelineEngine, PipelineResult,
    Resolution, Revision, RunHandle, RunId, RunStatus, StageDef, StageStatus, Topology,
    TIMEOUT_ACTOR,
};
use promote_store::StoreResult;

struct Harness {
    deployer: Arc<RecordingDeployer>,
    runner: Arc<ScriptedCommandRunner>,
    notifier: Arc<RecordingNotifier>,
    store: Arc<dyn ArtifactStore>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(deployer: RecordingDeployer, runner: ScriptedCommandRunner) -> Self {
        Self::with(
            deployer,
            runner,
            RecordingNotifier::new(),
            EngineConfig::default(),
            Arc::new(MemoryArtifactStore::new()),
        )
    }

    fn with(
        deployer: RecordingDeployer,
        runner: ScriptedCommandRunner,
        notifier: RecordingNotifier,
        config: EngineConfig,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let deployer = Arc::new(deployer);
        let runner = Arc::new(runner);
        let notifier = Arc::new(notifier);
        let engine = PipelineEngine::new(deployer.clone(), runner.clone(), notifier.clone())
            .with_config(config);
        let orchestrator = Orchestrator::new(engine, store.clone());
        Self {
            deployer,
            runner,
            notifier,
            store,
            orchestrator,
        }
    }

    fn start(&self, topology: &Topology) -> RunHandle {
        self.orchestrator.start(topology, Revision::new("r1"))
    }
}

/// `dev(deploy, integration test)` then `prod(approval, deploy)`.
fn dev_prod() -> Topology {
    Topology::new(
        "user-api",
        vec![
            StageDef::new("dev")
                .action(ActionDef::deploy("deploy"))
                .action(ActionDef::test(
                    "integration",
                    &["npm", "run", "integration"],
                    &[("SERVICE_URL", OutputRef::new("dev", "deploy"))],
                )),
            StageDef::new("prod")
                .action(
                    ActionDef::approval("approve", &["alice"], &["ops@example.com"])
                        .with_note("Manual approval for the production stage"),
                )
                .action(ActionDef::deploy("deploy")),
        ],
    )
    .unwrap()
}

async fn await_gate(handle: &RunHandle, stage: &str) {
    let reached = tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for_status(stage, StageStatus::AwaitingApproval),
    )
    .await
    .expect("timed out waiting for the approval gate");
    assert!(reached, "run ended before {stage} awaited approval");
}

fn stage_events(result: &PipelineResult) -> Vec<String> {
    result
        .journal
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StageStarted { stage } => Some(format!("start:{stage}")),
            EventKind::StageFinished { stage, status } => Some(format!("end:{stage}:{status}")),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn approved_run_promotes_to_prod() {
    let h = Harness::new(RecordingDeployer::new(), ScriptedCommandRunner::new());
    let topology = dev_prod();
    let handle = h.start(&topology);

    await_gate(&handle, "prod").await;
    let snapshot = handle.status();
    assert_eq!(snapshot.status_of("dev"), Some(StageStatus::Succeeded));
    assert_eq!(h.deployer.environments(), vec!["dev"]);
    assert_eq!(handle.approvals().pending().len(), 1);

    handle
        .resolve(Resolution::approve("prod", "alice").with_comment("ship it"))
        .unwrap();
    let result = handle.join().await.unwrap();

    assert!(result.success());
    assert_eq!(result.status.exit_code(), 0);
    assert_eq!(result.status_of("dev"), Some(StageStatus::Succeeded));
    assert_eq!(result.status_of("prod"), Some(StageStatus::Succeeded));
    assert_eq!(h.deployer.environments(), vec!["dev", "prod"]);
    assert_eq!(
        result.endpoint("prod", "deploy").unwrap().as_str(),
        "https://prod.example.test/r1"
    );
    assert_eq!(result.topology_digest, topology.digest());

    let verdict = result.stage("prod").unwrap().approval.clone().unwrap();
    assert_eq!(verdict.actor.as_str(), "alice");
    assert_eq!(verdict.comment.as_deref(), Some("ship it"));
}

#[tokio::test]
async fn deploy_output_is_injected_into_test() {
    let h = Harness::new(RecordingDeployer::new(), ScriptedCommandRunner::new());
    let handle = h.start(&dev_prod());
    await_gate(&handle, "prod").await;
    handle.cancel();
    handle.join().await.unwrap();

    let tests = h.runner.invocations_of("npm");
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0].command, vec!["npm", "run", "integration"]);
    assert_eq!(tests[0].env["SERVICE_URL"], "https://dev.example.test/r1");
    assert_eq!(tests[0].env["PROMOTE_ENVIRONMENT"], "dev");
    assert_eq!(tests[0].env["PROMOTE_REVISION"], "r1");
}

#[tokio::test]
async fn failing_dev_test_never_reaches_prod() {
    let h = Harness::new(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new().respond("npm", 1, "1 failing"),
    );
    let result = h.orchestrator.run(&dev_prod(), Revision::new("r1")).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status.exit_code(), 1);
    assert_eq!(result.status_of("dev"), Some(StageStatus::Failed));
    assert_eq!(result.status_of("prod"), Some(StageStatus::Pending));
    assert_eq!(h.deployer.environments(), vec!["dev"]);

    let failure = result.first_failure.clone().unwrap();
    assert_eq!(failure.stage.as_str(), "dev");
    assert_eq!(failure.action, "integration");
    assert_eq!(failure.kind, FailureKind::TestFailed);
    assert!(failure.output.unwrap().contains("1 failing"));
    // Succeeded work is preserved.
    assert!(result.endpoint("dev", "deploy").is_some());
}

#[tokio::test]
async fn rejected_approval_skips_prod_deploy() {
    let h = Harness::new(RecordingDeployer::new(), ScriptedCommandRunner::new());
    let handle = h.start(&dev_prod());
    await_gate(&handle, "prod").await;

    handle
        .resolve(Resolution::reject("prod", "alice").with_comment("freeze week"))
        .unwrap();
    let result = handle.join().await.unwrap();

    assert_eq!(result.status, RunStatus::Rejected);
    assert_eq!(result.status.exit_code(), 2);
    assert_eq!(result.status_of("dev"), Some(StageStatus::Succeeded));
    assert_eq!(result.status_of("prod"), Some(StageStatus::Rejected));
    assert_eq!(h.deployer.environments(), vec!["dev"]);
    assert_eq!(result.first_failure.unwrap().kind, FailureKind::Rejected);
}

#[tokio::test]
async fn failed_deploy_halts_before_tests_and_later_stages() {
    let h = Harness::new(
        RecordingDeployer::new().failing_on("dev"),
        ScriptedCommandRunner::new(),
    );
    let result = h.orchestrator.run(&dev_prod(), Revision::new("r1")).await;

    assert_eq!(result.status_of("dev"), Some(StageStatus::Failed));
    assert_eq!(result.status_of("prod"), Some(StageStatus::Pending));
    assert!(h.runner.invocations().is_empty());
    assert_eq!(h.deployer.environments(), vec!["dev"]);

    let failure = result.first_failure.unwrap();
    assert_eq!(failure.kind, FailureKind::DeploymentFailed);
    assert!(failure.message.contains("quota exceeded in dev"));
}

#[tokio::test]
async fn gate_accepts_exactly_one_resolution() {
    let h = Harness::new(RecordingDeployer::new(), ScriptedCommandRunner::new());
    let handle = h.start(&dev_prod());
    await_gate(&handle, "prod").await;

    assert_eq!(
        handle.resolve(Resolution::approve("dev", "alice")),
        Err(ApprovalError::UnknownStage("dev".into()))
    );
    assert_eq!(
        handle.resolve(Resolution::approve("qa", "alice")),
        Err(ApprovalError::UnknownStage("qa".into()))
    );
    assert!(matches!(
        handle.resolve(Resolution::approve("prod", "mallory")),
        Err(ApprovalError::UnauthorizedActor { .. })
    ));
    // Failed calls leave the gate open.
    assert_eq!(
        handle.status().status_of("prod"),
        Some(StageStatus::AwaitingApproval)
    );

    handle.resolve(Resolution::approve("prod", "alice")).unwrap();
    assert_eq!(
        handle.resolve(Resolution::reject("prod", "alice")),
        Err(ApprovalError::AlreadyResolved("prod".into()))
    );

    let result = handle.join().await.unwrap();
    assert_eq!(result.status_of("prod"), Some(StageStatus::Succeeded));
    assert!(result.stage("prod").unwrap().approval.as_ref().unwrap().is_approved());
}

#[tokio::test]
async fn approvers_are_notified_and_failures_are_not_fatal() {
    let h = Harness::with(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new(),
        RecordingNotifier::new().failing_for("pager@example.com"),
        EngineConfig::default(),
        Arc::new(MemoryArtifactStore::new()),
    );
    let topology = Topology::new(
        "p",
        vec![StageDef::new("prod")
            .action(
                ActionDef::approval("approve", &[], &["ops@example.com", "pager@example.com"])
                    .with_note("check the dashboards"),
            )
            .action(ActionDef::deploy("deploy"))],
    )
    .unwrap();
    let handle = h.start(&topology);
    await_gate(&handle, "prod").await;

    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0.as_str(), "ops@example.com");
    assert!(messages[0].1.contains("prod"));
    assert!(messages[0].1.contains("check the dashboards"));
    assert_eq!(
        handle.approvals().pending()[0].note.as_deref(),
        Some("check the dashboards")
    );

    // Empty approver set: anyone may resolve.
    handle.resolve(Resolution::approve("prod", "bob")).unwrap();
    let result = handle.join().await.unwrap();
    assert!(result.success());
    assert!(result.journal.iter().any(|e| matches!(
        &e.kind,
        EventKind::NotificationFailed { contact, .. } if contact == "pager@example.com"
    )));
}

#[tokio::test(start_paused = true)]
async fn unanswered_gate_expires_as_rejection() {
    let h = Harness::with(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new(),
        RecordingNotifier::new(),
        EngineConfig {
            approval_timeout: Some(Duration::from_secs(3600)),
            ..EngineConfig::default()
        },
        Arc::new(MemoryArtifactStore::new()),
    );
    let result = h.orchestrator.run(&dev_prod(), Revision::new("r1")).await;

    assert_eq!(result.status, RunStatus::Rejected);
    let verdict = result.stage("prod").unwrap().approval.clone().unwrap();
    assert_eq!(verdict.actor.as_str(), TIMEOUT_ACTOR);
    assert_eq!(h.deployer.environments(), vec!["dev"]);
}

#[tokio::test(start_paused = true)]
async fn hanging_test_fails_after_command_timeout() {
    let h = Harness::with(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new().hang("npm"),
        RecordingNotifier::new(),
        EngineConfig {
            command_timeout: Some(Duration::from_secs(60)),
            ..EngineConfig::default()
        },
        Arc::new(MemoryArtifactStore::new()),
    );
    let result = h.orchestrator.run(&dev_prod(), Revision::new("r1")).await;

    assert_eq!(result.status_of("dev"), Some(StageStatus::Failed));
    let failure = result.first_failure.unwrap();
    assert_eq!(failure.kind, FailureKind::TestFailed);
    assert!(failure.message.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn equal_run_orders_run_concurrently() {
    let concurrent = Topology::new(
        "p",
        vec![StageDef::new("dev")
            .action(ActionDef::deploy("api").run_order(1))
            .action(ActionDef::deploy("worker").run_order(1))
            .action(ActionDef::test("smoke", &["smoke"], &[]).run_order(2))],
    )
    .unwrap();
    let h = Harness::new(
        RecordingDeployer::new().with_delay(Duration::from_millis(100)),
        ScriptedCommandRunner::new(),
    );
    let result = h.orchestrator.run(&concurrent, Revision::new("r1")).await;
    assert!(result.success());
    assert_eq!(h.deployer.max_concurrency(), 2);
    assert_eq!(result.stage("dev").unwrap().outputs.len(), 2);

    let sequential = Topology::new(
        "p",
        vec![StageDef::new("dev")
            .action(ActionDef::deploy("api"))
            .action(ActionDef::deploy("worker"))],
    )
    .unwrap();
    let h = Harness::new(
        RecordingDeployer::new().with_delay(Duration::from_millis(100)),
        ScriptedCommandRunner::new(),
    );
    h.orchestrator.run(&sequential, Revision::new("r1")).await;
    assert_eq!(h.deployer.max_concurrency(), 1);
}

#[tokio::test]
async fn failing_sibling_in_concurrent_group_fails_stage() {
    let topology = Topology::new(
        "p",
        vec![
            StageDef::new("dev")
                .action(ActionDef::deploy("api").run_order(1))
                .action(ActionDef::test("bad", &["check"], &[]).run_order(1)),
            StageDef::new("prod").action(ActionDef::deploy("deploy")),
        ],
    )
    .unwrap();
    let h = Harness::new(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new().respond("check", 1, "broken"),
    );
    let result = h.orchestrator.run(&topology, Revision::new("r1")).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status_of("dev"), Some(StageStatus::Failed));
    assert_eq!(result.status_of("prod"), Some(StageStatus::Pending));
    assert_eq!(h.deployer.environments(), vec!["dev"]);
    // The sibling deploy finished and its output is kept.
    assert_eq!(
        result.endpoint("dev", "api").unwrap().as_str(),
        "https://dev.example.test/r1"
    );

    let failure = result.first_failure.clone().unwrap();
    assert_eq!(failure.action, "bad");
    assert_eq!(failure.kind, FailureKind::TestFailed);
}

#[tokio::test]
async fn stages_start_only_after_previous_succeeds() {
    let h = Harness::new(RecordingDeployer::new(), ScriptedCommandRunner::new());
    let handle = h.start(&dev_prod());
    await_gate(&handle, "prod").await;
    handle.resolve(Resolution::approve("prod", "alice")).unwrap();
    let result = handle.join().await.unwrap();

    assert_eq!(
        stage_events(&result),
        vec![
            "start:dev",
            "end:dev:succeeded",
            "start:prod",
            "end:prod:succeeded"
        ]
    );
    let seqs: Vec<u64> = result.journal.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] + 1 == w[1]));
    assert!(matches!(result.journal[0].kind, EventKind::RunStarted { .. }));
}

#[tokio::test]
async fn build_output_is_handed_to_deploy() {
    let h = Harness::new(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new().respond("cdk", 0, "{\"Resources\":{}}"),
    );
    let topology = Topology::new(
        "p",
        vec![
            StageDef::new("synth").action(ActionDef::build("synth", &["cdk", "synth"], "assembly")),
            StageDef::new("dev").action(ActionDef::deploy_artifact(
                "deploy",
                ArtifactKey::new("synth", "assembly").unwrap(),
            )),
        ],
    )
    .unwrap();
    let result = h.orchestrator.run(&topology, Revision::new("r1")).await;
    assert!(result.success());

    let calls = h.deployer.calls();
    let artifact = calls[0].artifact.as_ref().unwrap();
    assert_eq!(artifact.key.to_string(), "synth/assembly");
    assert_eq!(artifact.bytes, b"{\"Resources\":{}}");
    assert_eq!(result.stage("synth").unwrap().artifacts.len(), 1);

    let stored = h.store.list(&result.run_id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(h.orchestrator.cleanup(&result.run_id).await.unwrap(), 1);
    assert!(h.store.list(&result.run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_build_keeps_command_output() {
    let h = Harness::new(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new().respond("cdk", 2, "synth error"),
    );
    let topology = Topology::new(
        "p",
        vec![
            StageDef::new("synth").action(ActionDef::build("synth", &["cdk", "synth"], "assembly")),
            StageDef::new("dev").action(ActionDef::deploy("deploy")),
        ],
    )
    .unwrap();
    let result = h.orchestrator.run(&topology, Revision::new("r1")).await;

    assert_eq!(result.status_of("synth"), Some(StageStatus::Failed));
    let failure = result.first_failure.unwrap();
    assert_eq!(failure.kind, FailureKind::BuildFailed);
    assert!(failure.output.unwrap().contains("synth error"));
    assert!(h.deployer.calls().is_empty());
}

/// Store that acknowledges writes but never keeps them.
struct ForgetfulStore {
    scratch: MemoryArtifactStore,
    kept: MemoryArtifactStore,
}

#[async_trait]
impl ArtifactStore for ForgetfulStore {
    async fn put(&self, run_id: &RunId, key: &ArtifactKey, bytes: &[u8]) -> StoreResult<ArtifactRef> {
        self.scratch.put(run_id, key, bytes).await
    }

    async fn get(&self, artifact: &ArtifactRef) -> StoreResult<Vec<u8>> {
        self.kept.get(artifact).await
    }

    async fn resolve(&self, run_id: &RunId, key: &ArtifactKey) -> StoreResult<ArtifactRef> {
        self.kept.resolve(run_id, key).await
    }

    async fn list(&self, run_id: &RunId) -> StoreResult<Vec<ArtifactRef>> {
        self.kept.list(run_id).await
    }

    async fn purge_run(&self, run_id: &RunId) -> StoreResult<usize> {
        self.kept.purge_run(run_id).await
    }
}

#[tokio::test]
async fn missing_artifact_fails_the_deploy() {
    let store = Arc::new(ForgetfulStore {
        scratch: MemoryArtifactStore::new(),
        kept: MemoryArtifactStore::new(),
    });
    let h = Harness::with(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new(),
        RecordingNotifier::new(),
        EngineConfig::default(),
        store,
    );
    let topology = Topology::new(
        "p",
        vec![
            StageDef::new("synth").action(ActionDef::build("synth", &["cdk"], "assembly")),
            StageDef::new("dev").action(ActionDef::deploy_artifact(
                "deploy",
                ArtifactKey::new("synth", "assembly").unwrap(),
            )),
        ],
    )
    .unwrap();
    let result = h.orchestrator.run(&topology, Revision::new("r1")).await;

    assert_eq!(result.status_of("synth"), Some(StageStatus::Succeeded));
    assert_eq!(result.status_of("dev"), Some(StageStatus::Failed));
    assert_eq!(
        result.first_failure.unwrap().kind,
        FailureKind::ArtifactNotFound
    );
    assert!(h.deployer.calls().is_empty());
}

#[tokio::test]
async fn cancel_while_awaiting_approval() {
    let h = Harness::new(RecordingDeployer::new(), ScriptedCommandRunner::new());
    let handle = h.start(&dev_prod());
    await_gate(&handle, "prod").await;

    let approvals = handle.approvals().clone();
    handle.cancel();
    let result = handle.join().await.unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.status.exit_code(), 3);
    assert_eq!(result.status_of("dev"), Some(StageStatus::Succeeded));
    assert_eq!(result.status_of("prod"), Some(StageStatus::Cancelled));
    assert_eq!(h.deployer.environments(), vec!["dev"]);
    assert!(matches!(
        result.journal.last().unwrap().kind,
        EventKind::RunCancelled
    ));
    // The withdrawn gate no longer accepts decisions.
    assert_eq!(
        approvals.resolve(Resolution::approve("prod", "alice")),
        Err(ApprovalError::UnknownStage("prod".into()))
    );
}

#[tokio::test]
async fn cancel_abandons_running_test() {
    let h = Harness::new(
        RecordingDeployer::new(),
        ScriptedCommandRunner::new().hang("npm"),
    );
    let handle = h.start(&dev_prod());

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.runner.invocations_of("npm").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("test command never started");

    handle.cancel();
    let result = handle.join().await.unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.status_of("dev"), Some(StageStatus::Cancelled));
    assert_eq!(result.status_of("prod"), Some(StageStatus::Cancelled));
    assert_eq!(h.deployer.environments(), vec!["dev"]);
    assert!(result.first_failure.is_none());
}
