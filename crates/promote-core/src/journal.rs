//! Sequenced audit log of a pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::Decision;
use crate::error::FailureKind;
use crate::model::{Revision, StageId, StageStatus};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        revision: Revision,
    },
    StageStarted {
        stage: StageId,
    },
    ActionStarted {
        stage: StageId,
        action: String,
    },
    ActionSucceeded {
        stage: StageId,
        action: String,
    },
    ActionFailed {
        stage: StageId,
        action: String,
        kind: FailureKind,
        message: String,
    },
    ApprovalRequested {
        stage: StageId,
        action: String,
    },
    ApprovalResolved {
        stage: StageId,
        decision: Decision,
        actor: String,
    },
    NotificationFailed {
        stage: StageId,
        contact: String,
        error: String,
    },
    StageFinished {
        stage: StageId,
        status: StageStatus,
    },
    RunCancelled,
}

/// A single journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Monotonic sequence number within the run, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Append-only event log. Owned and written by the engine only.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Vec<PipelineEvent>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EventKind) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(PipelineEvent {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<PipelineEvent> {
        self.events
    }
}
