//! Declarative pipeline topology.
//!
//! A topology is built once, validated, and never mutated afterwards. It can
//! be assembled in code with [`StageDef`] / [`ActionDef`] or loaded from TOML:
//!
//! ```toml
//! [pipeline]
//! name = "user-api"
//!
//! [deployer]
//! command = ["./scripts/deploy.sh"]
//!
//! [[stages]]
//! name = "dev"
//!
//! [[stages.actions]]
//! kind = "deploy"
//! name = "deploy"
//!
//! [[stages.actions]]
//! kind = "test"
//! name = "integration"
//! command = ["npm", "run", "integration"]
//! outputs = { SERVICE_URL = "dev.deploy" }
//! ```
//!
//! Actions without an explicit `run_order` run after every action declared
//! before them in the same stage.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use promote_store::ArtifactKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TopologyError;
use crate::model::{group_by_run_order, Action, ActionSpec, Contact, Identity, OutputRef, StageId};

/// Action as declared, before run orders are assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_order: Option<u32>,
    #[serde(flatten)]
    pub spec: ActionSpec,
}

impl ActionDef {
    pub fn deploy(name: &str) -> Self {
        Self::with_spec(name, ActionSpec::Deploy { artifact: None })
    }

    /// Deploy that hands the artifact `key` to the deployer.
    pub fn deploy_artifact(name: &str, key: ArtifactKey) -> Self {
        Self::with_spec(
            name,
            ActionSpec::Deploy {
                artifact: Some(key),
            },
        )
    }

    pub fn test(name: &str, command: &[&str], outputs: &[(&str, OutputRef)]) -> Self {
        Self::with_spec(
            name,
            ActionSpec::Test {
                command: argv(command),
                outputs: outputs
                    .iter()
                    .map(|(var, r)| (var.to_string(), r.clone()))
                    .collect(),
            },
        )
    }

    pub fn build(name: &str, command: &[&str], output: &str) -> Self {
        Self::with_spec(
            name,
            ActionSpec::Build {
                command: argv(command),
                output: output.to_string(),
            },
        )
    }

    pub fn approval(name: &str, approvers: &[&str], notify: &[&str]) -> Self {
        Self::with_spec(
            name,
            ActionSpec::Approval {
                approvers: approvers.iter().map(|a| Identity::new(*a)).collect(),
                notify: notify.iter().map(|c| Contact::new(*c)).collect(),
                note: None,
            },
        )
    }

    /// Attach additional information to an approval action; no effect on
    /// other kinds.
    pub fn with_note(mut self, text: &str) -> Self {
        if let ActionSpec::Approval { note, .. } = &mut self.spec {
            *note = Some(text.to_string());
        }
        self
    }

    pub fn run_order(mut self, order: u32) -> Self {
        self.run_order = Some(order);
        self
    }

    fn with_spec(name: &str, spec: ActionSpec) -> Self {
        Self {
            name: name.to_string(),
            run_order: None,
            spec,
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Stage as declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    /// Target environment; defaults to the stage name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

impl StageDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            environment: None,
            actions: Vec::new(),
        }
    }

    pub fn environment(mut self, environment: &str) -> Self {
        self.environment = Some(environment.to_string());
        self
    }

    pub fn action(mut self, action: ActionDef) -> Self {
        self.actions.push(action);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PipelineSection {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeployerSection {
    command: Vec<String>,
}

/// On-disk topology document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TopologyFile {
    pipeline: PipelineSection,
    #[serde(default)]
    deployer: Option<DeployerSection>,
    #[serde(default)]
    stages: Vec<StageDef>,
}

/// A validated stage template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub id: StageId,
    pub environment: String,
    pub actions: Vec<Action>,
}

impl StagePlan {
    pub fn run_order_groups(&self) -> Vec<(u32, Vec<&Action>)> {
        group_by_run_order(&self.actions)
    }
}

/// A validated, immutable pipeline topology.
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    name: String,
    deployer_command: Option<Vec<String>>,
    stages: Vec<StagePlan>,
    digest: String,
}

impl Topology {
    /// Validate `stages` into a topology.
    pub fn new(name: &str, stages: Vec<StageDef>) -> Result<Self, TopologyError> {
        let stages = validate(stages)?;
        let digest = compute_topology_digest(name, &stages);
        Ok(Self {
            name: name.to_string(),
            deployer_command: None,
            stages,
            digest,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, TopologyError> {
        let file: TopologyFile = toml::from_str(text)?;
        let topology = Self::new(&file.pipeline.name, file.stages)?;
        Ok(topology.with_deployer_command(file.deployer.map(|d| d.command)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Command used by a [`CommandDeployer`](crate::CommandDeployer) built from
    /// this topology.
    pub fn with_deployer_command(mut self, command: Option<Vec<String>>) -> Self {
        self.deployer_command = command.filter(|c| !c.is_empty());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deployer_command(&self) -> Option<&[String]> {
        self.deployer_command.as_deref()
    }

    pub fn stages(&self) -> &[StagePlan] {
        &self.stages
    }

    /// SHA-256 over the validated stages (hex). Equal topologies share a digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

fn validate_name(name: &str) -> Result<(), TopologyError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TopologyError::InvalidName(name.to_string()))
    }
}

/// Position of an action: (stage index, run order).
type Position = (usize, u32);

fn precedes(producer: Position, consumer: Position) -> bool {
    producer.0 < consumer.0 || (producer.0 == consumer.0 && producer.1 < consumer.1)
}

fn validate(defs: Vec<StageDef>) -> Result<Vec<StagePlan>, TopologyError> {
    if defs.is_empty() {
        return Err(TopologyError::EmptyPipeline);
    }

    let mut stage_names = HashSet::new();
    let mut deploys: HashMap<OutputRef, Position> = HashMap::new();
    let mut builds: HashMap<ArtifactKey, Position> = HashMap::new();
    let mut plans = Vec::with_capacity(defs.len());

    for (idx, def) in defs.into_iter().enumerate() {
        validate_name(&def.name)?;
        if !stage_names.insert(def.name.clone()) {
            return Err(TopologyError::DuplicateStage(def.name));
        }
        if def.actions.is_empty() {
            return Err(TopologyError::EmptyStage(def.name));
        }

        let mut action_names = HashSet::new();
        let mut approvals = 0;
        let mut last_order: u32 = 0;
        let mut actions = Vec::with_capacity(def.actions.len());

        for action in def.actions {
            validate_name(&action.name)?;
            if !action_names.insert(action.name.clone()) {
                return Err(TopologyError::DuplicateAction {
                    stage: def.name.clone(),
                    action: action.name,
                });
            }

            let run_order = match action.run_order {
                Some(order) => order,
                None => last_order.checked_add(1).ok_or_else(|| {
                    TopologyError::InvalidRunOrder {
                        stage: def.name.clone(),
                        action: action.name.clone(),
                    }
                })?,
            };
            if run_order == 0 {
                return Err(TopologyError::InvalidRunOrder {
                    stage: def.name.clone(),
                    action: action.name,
                });
            }
            last_order = last_order.max(run_order);

            match &action.spec {
                ActionSpec::Deploy { .. } => {
                    deploys.insert(
                        OutputRef::new(def.name.as_str(), action.name.as_str()),
                        (idx, run_order),
                    );
                }
                ActionSpec::Build { command, output } => {
                    if command.is_empty() {
                        return Err(TopologyError::EmptyCommand {
                            stage: def.name.clone(),
                            action: action.name,
                        });
                    }
                    validate_name(output)?;
                    builds.insert(ArtifactKey::new(def.name.as_str(), output.as_str())?, (idx, run_order));
                }
                ActionSpec::Test { command, .. } => {
                    if command.is_empty() {
                        return Err(TopologyError::EmptyCommand {
                            stage: def.name.clone(),
                            action: action.name,
                        });
                    }
                }
                ActionSpec::Approval { .. } => {
                    approvals += 1;
                    if approvals > 1 {
                        return Err(TopologyError::MultipleApprovals(def.name));
                    }
                }
            }

            actions.push(Action {
                name: action.name,
                run_order,
                spec: action.spec,
            });
        }

        let environment = def.environment.unwrap_or_else(|| def.name.clone());
        plans.push(StagePlan {
            id: StageId::new(def.name),
            environment,
            actions,
        });
    }

    for (idx, plan) in plans.iter().enumerate() {
        for action in &plan.actions {
            let consumer = (idx, action.run_order);
            match &action.spec {
                ActionSpec::Test { outputs, .. } => {
                    for reference in outputs.values() {
                        let produced = deploys
                            .get(reference)
                            .is_some_and(|&producer| precedes(producer, consumer));
                        if !produced {
                            return Err(TopologyError::UnresolvedOutput {
                                stage: plan.id.to_string(),
                                action: action.name.clone(),
                                reference: reference.to_string(),
                            });
                        }
                    }
                }
                ActionSpec::Deploy {
                    artifact: Some(key),
                } => {
                    let produced = builds
                        .get(key)
                        .is_some_and(|&producer| precedes(producer, consumer));
                    if !produced {
                        return Err(TopologyError::UnresolvedArtifact {
                            stage: plan.id.to_string(),
                            action: action.name.clone(),
                            key: key.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
    }

    Ok(plans)
}

/// Compute a deterministic digest of the validated stages.
fn compute_topology_digest(name: &str, stages: &[StagePlan]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    // BTree collections inside the plan keep this encoding stable.
    hasher.update(serde_json::to_vec(stages).unwrap_or_default());
    hex::encode(hasher.finalize())
}
