//! Promote - multi-stage deployment pipeline CLI
//!
//! The `promote` command drives a revision through the stages of a topology
//! file, pausing at approval gates.
//!
//! ## Commands
//!
//! - `run`: execute a pipeline for one revision
//! - `validate`: check a topology file and print its digest
//! - `plan`: show stages and run-order groups without running anything

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use promote_core::{
    ActionSpec, ArtifactStore, CommandDeployer, CommandRunner, Decision, EngineConfig,
    LogNotifier, Orchestrator, PendingApproval, PipelineEngine, PipelineResult, ProcessRunner,
    Resolution, Revision, RunControls, StageStatus, Topology,
};
use promote_store::{FsArtifactStore, MemoryArtifactStore};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "promote")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Promote a revision through deployment stages", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "PROMOTE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a revision
    Run {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: PathBuf,

        /// Revision to promote (commit hash or build number)
        #[arg(short, long)]
        revision: String,

        /// Approve every gate without prompting
        #[arg(long, conflicts_with = "reject_all")]
        approve_all: bool,

        /// Reject every gate without prompting
        #[arg(long)]
        reject_all: bool,

        /// Identity recorded on approval decisions
        #[arg(long, default_value = "operator")]
        actor: String,

        /// Persist artifacts under this directory instead of in memory
        #[arg(long, env = "PROMOTE_ARTIFACT_DIR")]
        artifact_dir: Option<PathBuf>,

        /// Timeout for each test, build and deploy command
        #[arg(long, env = "PROMOTE_COMMAND_TIMEOUT_SECS")]
        command_timeout_secs: Option<u64>,

        /// Reject gates left undecided this long
        #[arg(long, env = "PROMOTE_APPROVAL_TIMEOUT_SECS")]
        approval_timeout_secs: Option<u64>,

        /// Keep the run's artifacts after it finishes
        #[arg(long)]
        keep_artifacts: bool,

        /// Write the full result (stages and journal) as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Validate a topology file
    Validate {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: PathBuf,
    },

    /// Print the execution plan of a topology
    Plan {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: PathBuf,
    },
}

/// How approval gates are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalMode {
    Prompt,
    Auto(Decision),
}

impl ApprovalMode {
    fn from_flags(approve_all: bool, reject_all: bool) -> Self {
        match (approve_all, reject_all) {
            (true, _) => Self::Auto(Decision::Approved),
            (_, true) => Self::Auto(Decision::Rejected),
            _ => Self::Prompt,
        }
    }
}

struct RunOptions {
    approvals: ApprovalMode,
    actor: String,
    artifact_dir: Option<PathBuf>,
    config: EngineConfig,
    keep_artifacts: bool,
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    promote_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            topology,
            revision,
            approve_all,
            reject_all,
            actor,
            artifact_dir,
            command_timeout_secs,
            approval_timeout_secs,
            keep_artifacts,
            report,
        } => {
            let options = RunOptions {
                approvals: ApprovalMode::from_flags(approve_all, reject_all),
                actor,
                artifact_dir,
                config: EngineConfig {
                    command_timeout: command_timeout_secs.map(Duration::from_secs),
                    approval_timeout: approval_timeout_secs.map(Duration::from_secs),
                },
                keep_artifacts,
                report,
            };
            let code = cmd_run(&topology, &revision, options).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Validate { topology } => cmd_validate(&topology),
        Commands::Plan { topology } => cmd_plan(&topology),
    }
}

fn load_topology(path: &Path) -> Result<Topology> {
    Topology::load(path).with_context(|| format!("Failed to load topology {}", path.display()))
}

/// Directory commands run from: the one holding the topology file.
fn topology_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|dir| !dir.as_os_str().is_empty())
}

async fn cmd_run(topology_path: &Path, revision: &str, options: RunOptions) -> Result<i32> {
    let topology = load_topology(topology_path)?;

    let runner: Arc<dyn CommandRunner> = match topology_dir(topology_path) {
        Some(dir) => Arc::new(ProcessRunner::in_dir(dir)),
        None => Arc::new(ProcessRunner::new()),
    };
    let deploy_command = topology.deployer_command().with_context(|| {
        format!(
            "Topology {} declares no [deployer] command",
            topology_path.display()
        )
    })?;
    let deployer = CommandDeployer::new(deploy_command.to_vec(), runner.clone())
        .with_timeout(options.config.command_timeout);

    let artifacts: Arc<dyn ArtifactStore> = match &options.artifact_dir {
        Some(dir) => Arc::new(
            FsArtifactStore::new(dir)
                .with_context(|| format!("Failed to open artifact store {}", dir.display()))?,
        ),
        None => Arc::new(MemoryArtifactStore::new()),
    };

    let engine = PipelineEngine::new(Arc::new(deployer), runner, Arc::new(LogNotifier))
        .with_config(options.config.clone());
    let orchestrator = Orchestrator::new(engine, artifacts);

    println!("Pipeline: {}", topology.name());
    println!("Revision: {}", revision);
    println!("Stages: {}", stage_names(&topology));
    println!();

    let mut handle = orchestrator.start(&topology, Revision::new(revision));
    println!("Run ID: {}", handle.run_id());

    let controls = handle.controls().clone();
    let mut updates = controls.subscribe();
    let mut seen = HashSet::new();
    let result = loop {
        for pending in controls.approvals().pending() {
            if seen.insert(pending.stage.clone()) {
                answer_gate(&controls, pending, options.approvals, &options.actor);
            }
        }
        tokio::select! {
            joined = handle.finished() => break joined.context("Pipeline task failed")?,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, cancelling run");
                controls.cancel();
            }
            _ = updates.changed() => {}
        }
    };

    print_result(&result);

    if let Some(path) = &options.report {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if options.keep_artifacts {
        info!(run_id = %result.run_id, "keeping run artifacts");
    } else if let Err(e) = orchestrator.cleanup(&result.run_id).await {
        warn!(run_id = %result.run_id, error = %e, "failed to purge run artifacts");
    }

    Ok(result.status.exit_code())
}

fn answer_gate(controls: &RunControls, pending: PendingApproval, mode: ApprovalMode, actor: &str) {
    println!();
    println!("⏸ Stage {} is awaiting approval", pending.stage);
    if let Some(note) = &pending.note {
        println!("  {}", note);
    }
    if !pending.approvers.is_empty() {
        let approvers: Vec<_> = pending.approvers.iter().map(|a| a.as_str()).collect();
        println!("  Approvers: {}", approvers.join(", "));
    }

    match mode {
        ApprovalMode::Auto(decision) => {
            resolve_gate(controls, resolution(&pending, decision, actor));
        }
        ApprovalMode::Prompt => {
            tokio::spawn(prompt_for_decision(controls.clone(), pending, actor.to_string()));
        }
    }
}

fn resolution(pending: &PendingApproval, decision: Decision, actor: &str) -> Resolution {
    match decision {
        Decision::Approved => Resolution::approve(pending.stage.clone(), actor),
        Decision::Rejected => Resolution::reject(pending.stage.clone(), actor),
    }
}

fn resolve_gate(controls: &RunControls, resolution: Resolution) {
    let stage = resolution.stage.clone();
    match controls.approvals().resolve(resolution) {
        Ok(verdict) => println!("  ✓ {} {} by {}", stage, verdict.decision, verdict.actor),
        Err(e) => eprintln!("  ✗ {}", e),
    }
}

/// Parse an interactive answer. `None` means ask again.
fn parse_answer(answer: &str) -> Option<Decision> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "approve" => Some(Decision::Approved),
        "n" | "no" | "reject" => Some(Decision::Rejected),
        _ => None,
    }
}

async fn prompt_for_decision(controls: RunControls, pending: PendingApproval, actor: String) {
    loop {
        print!("Promote to {}? [y/n] ", pending.stage);
        let _ = std::io::stdout().flush();

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|n| (n, line))
        })
        .await;
        let answer = match line {
            Ok(Ok((n, line))) if n > 0 => line,
            // EOF or read failure: leave the gate open, Ctrl-C still cancels.
            _ => return,
        };

        match parse_answer(&answer) {
            Some(decision) => {
                resolve_gate(&controls, resolution(&pending, decision, &actor));
                return;
            }
            None => println!("Please answer y or n."),
        }
    }
}

fn stage_names(topology: &Topology) -> String {
    topology
        .stages()
        .iter()
        .map(|s| s.id.as_str())
        .collect::<Vec<_>>()
        .join(" → ")
}

fn status_marker(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Succeeded => "✓",
        StageStatus::Failed | StageStatus::Rejected => "✗",
        StageStatus::Cancelled => "⊘",
        _ => "·",
    }
}

fn print_result(result: &PipelineResult) {
    println!();
    println!(
        "Status: {}",
        if result.success() {
            "✓ PASSED".to_string()
        } else {
            format!("✗ {}", result.status.as_str().to_uppercase())
        }
    );
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for stage in &result.stages {
        let timing = stage
            .duration_ms()
            .map(|ms| format!(" ({}ms)", ms))
            .unwrap_or_default();
        println!(
            "  {} {} [{}] {}{}",
            status_marker(stage.status),
            stage.id,
            stage.environment,
            stage.status,
            timing
        );
        for (action, endpoint) in &stage.outputs {
            println!("      {} → {}", action, endpoint);
        }
        if let Some(verdict) = &stage.approval {
            println!("      {} by {}", verdict.decision, verdict.actor);
        }
    }

    println!();
    println!(
        "Summary: {}/{} stages passed",
        result.passed_count(),
        result.stages.len()
    );

    if let Some(failure) = &result.first_failure {
        println!();
        println!("First failure: {}/{}: {}", failure.stage, failure.action, failure.message);
        if let Some(output) = &failure.output {
            for line in output.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
                println!("  | {}", line);
            }
        }
    }
}

fn cmd_validate(path: &Path) -> Result<()> {
    let topology = load_topology(path)?;
    let actions: usize = topology.stages().iter().map(|s| s.actions.len()).sum();
    println!(
        "✓ {}: {} stages, {} actions",
        topology.name(),
        topology.stages().len(),
        actions
    );
    println!("Digest: {}", topology.digest());
    Ok(())
}

fn describe_action(spec: &ActionSpec) -> String {
    match spec {
        ActionSpec::Deploy { artifact: None } => "deploy".to_string(),
        ActionSpec::Deploy {
            artifact: Some(key),
        } => format!("deploy {}", key),
        ActionSpec::Test { command, outputs } => {
            let mut text = format!("test `{}`", command.join(" "));
            if !outputs.is_empty() {
                let bindings: Vec<_> = outputs
                    .iter()
                    .map(|(var, reference)| format!("{}={}", var, reference))
                    .collect();
                text.push_str(&format!(" with {}", bindings.join(", ")));
            }
            text
        }
        ActionSpec::Build { command, output } => {
            format!("build `{}` -> {}", command.join(" "), output)
        }
        ActionSpec::Approval {
            approvers, notify, ..
        } => {
            let approvers = if approvers.is_empty() {
                "anyone".to_string()
            } else {
                approvers
                    .iter()
                    .map(|a| a.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!(
                "approval by {} (notify {})",
                approvers,
                notify.len()
            )
        }
    }
}

fn render_plan(topology: &Topology) -> String {
    let mut out = format!("Pipeline: {} ({})\n", topology.name(), &topology.digest()[..12]);
    for (idx, stage) in topology.stages().iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} → {}\n",
            idx + 1,
            stage.id,
            stage.environment
        ));
        for (run_order, actions) in stage.run_order_groups() {
            for action in actions {
                out.push_str(&format!(
                    "   [{}] {}: {}\n",
                    run_order,
                    action.name,
                    describe_action(&action.spec)
                ));
            }
        }
    }
    out
}

fn cmd_plan(path: &Path) -> Result<()> {
    let topology = load_topology(path)?;
    print!("{}", render_plan(&topology));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn sample_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("topologies/user-api.toml")
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "promote",
            "run",
            "--topology",
            "pipeline.toml",
            "--revision",
            "abc123",
            "--approve-all",
            "--report",
            "out.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                revision,
                approve_all,
                reject_all,
                report,
                ..
            } => {
                assert_eq!(revision, "abc123");
                assert!(approve_all);
                assert!(!reject_all);
                assert_eq!(report, Some(PathBuf::from("out.json")));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_approve_and_reject_conflict() {
        let parsed = Cli::try_parse_from([
            "promote",
            "run",
            "-t",
            "p.toml",
            "-r",
            "abc",
            "--approve-all",
            "--reject-all",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_approval_mode_from_flags() {
        assert_eq!(ApprovalMode::from_flags(false, false), ApprovalMode::Prompt);
        assert_eq!(
            ApprovalMode::from_flags(true, false),
            ApprovalMode::Auto(Decision::Approved)
        );
        assert_eq!(
            ApprovalMode::from_flags(false, true),
            ApprovalMode::Auto(Decision::Rejected)
        );
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), Some(Decision::Approved));
        assert_eq!(parse_answer(" YES "), Some(Decision::Approved));
        assert_eq!(parse_answer("n"), Some(Decision::Rejected));
        assert_eq!(parse_answer("maybe"), None);
    }

    #[test]
    fn test_plan_lists_groups_in_order() {
        let topology = load_topology(&sample_path()).unwrap();
        let plan = render_plan(&topology);
        assert!(plan.starts_with("Pipeline: user-api"));
        let dev_deploy = plan.find("[1] deploy: deploy synth/assembly").unwrap();
        let dev_test = plan
            .find("[2] integration: test `npm run integration` with SERVICE_URL=dev.deploy")
            .unwrap();
        assert!(dev_deploy < dev_test);
        assert!(plan.contains("3. prod → production"));
        assert!(plan.contains("approval by release-manager (notify 1)"));
    }

    #[test]
    fn test_topology_dir() {
        assert_eq!(
            topology_dir(Path::new("deploy/pipeline.toml")),
            Some(Path::new("deploy"))
        );
        assert_eq!(topology_dir(Path::new("pipeline.toml")), None);
    }

    #[test]
    fn test_validate_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_validate(&dir.path().join("missing.toml")).is_err());
    }
}
