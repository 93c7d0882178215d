//! Pipeline domain model: revisions, stages, actions and their statuses.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use promote_store::{ArtifactKey, ArtifactRef};
use serde::{Deserialize, Serialize};

use crate::approval::Verdict;
use crate::deploy::EnvironmentEndpoint;
use crate::error::{FailureCause, TopologyError};

/// Immutable identifier of the source snapshot being promoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stage identifier (the stage name, unique within a topology).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A person or system allowed to resolve approval gates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification address (e-mail, chat channel, ...). Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contact(String);

impl Contact {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the output of a deploy action: `<stage>.<action>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct OutputRef {
    pub stage: StageId,
    pub action: String,
}

impl OutputRef {
    pub fn new(stage: impl Into<StageId>, action: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.action)
    }
}

impl FromStr for OutputRef {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((stage, action)) if !stage.is_empty() && !action.is_empty() => {
                Ok(Self::new(stage, action))
            }
            _ => Err(TopologyError::InvalidOutputRef(s.to_string())),
        }
    }
}

impl From<OutputRef> for String {
    fn from(r: OutputRef) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for OutputRef {
    type Error = TopologyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// What an action does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSpec {
    /// Provision the stage's environment at the run's revision.
    Deploy {
        /// Build output handed to the deployer (e.g. a synthesized assembly).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<ArtifactKey>,
    },

    /// Run a command against deployed outputs; non-zero exit fails the stage.
    Test {
        command: Vec<String>,
        /// Environment variable name -> deploy output injected as its value.
        #[serde(default)]
        outputs: BTreeMap<String, OutputRef>,
    },

    /// Run a command and store its stdout as the artifact `<stage>/<output>`.
    Build { command: Vec<String>, output: String },

    /// Block the stage until an approver records a decision.
    Approval {
        #[serde(default)]
        approvers: BTreeSet<Identity>,
        #[serde(default)]
        notify: BTreeSet<Contact>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl ActionSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Deploy { .. } => "deploy",
            Self::Test { .. } => "test",
            Self::Build { .. } => "build",
            Self::Approval { .. } => "approval",
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, Self::Approval { .. })
    }
}

/// A unit of work inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    /// Ascending execution order; equal values run concurrently.
    pub run_order: u32,
    #[serde(flatten)]
    pub spec: ActionSpec,
}

/// Group `actions` by run order, ascending; declaration order within a group.
pub fn group_by_run_order(actions: &[Action]) -> Vec<(u32, Vec<&Action>)> {
    let mut groups: BTreeMap<u32, Vec<&Action>> = BTreeMap::new();
    for action in actions {
        groups.entry(action.run_order).or_default().push(action);
    }
    groups.into_iter().collect()
}

/// Lifecycle of a stage.
///
/// `Pending -> Running -> Succeeded | Failed`, with the approval detour
/// `Running -> AwaitingApproval -> Approved | Rejected`. `Cancelled` is
/// reached from any non-terminal state on operator abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    AwaitingApproval,
    Approved,
    Succeeded,
    Failed,
    Rejected,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage of a pipeline run. Terminal state persists for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub environment: String,
    pub actions: Vec<Action>,
    pub status: StageStatus,
    /// Deploy action name -> endpoint it produced.
    pub outputs: BTreeMap<String, EnvironmentEndpoint>,
    pub artifacts: Vec<ArtifactRef>,
    pub approval: Option<Verdict>,
    pub failure: Option<FailureCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(id: StageId, environment: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            id,
            environment: environment.into(),
            actions,
            status: StageStatus::Pending,
            outputs: BTreeMap::new(),
            artifacts: Vec::new(),
            approval: None,
            failure: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Actions grouped by run order, ascending; declaration order within a group.
    pub fn run_order_groups(&self) -> Vec<(u32, Vec<&Action>)> {
        group_by_run_order(&self.actions)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}
