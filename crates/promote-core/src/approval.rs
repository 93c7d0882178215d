//! Approval gates: blocking checkpoints resolved by an external actor.
//!
//! Each stage with an approval action gets exactly one gate per run. A gate
//! moves `Unresolved -> Approved | Rejected` once and never again. The engine
//! opens the gate and awaits the verdict; operators resolve it through the
//! shared [`ApprovalBoard`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ApprovalError;
use crate::model::{Identity, StageId};

/// Actor recorded when a gate expires without a decision.
pub const TIMEOUT_ACTOR: &str = "system:timeout";

/// Decision recorded on a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => f.write_str("approved"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// External resolution call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub stage: StageId,
    pub decision: Decision,
    pub actor: Identity,
    pub comment: Option<String>,
}

impl Resolution {
    pub fn approve(stage: impl Into<StageId>, actor: &str) -> Self {
        Self {
            stage: stage.into(),
            decision: Decision::Approved,
            actor: Identity::new(actor),
            comment: None,
        }
    }

    pub fn reject(stage: impl Into<StageId>, actor: &str) -> Self {
        Self {
            stage: stage.into(),
            decision: Decision::Rejected,
            actor: Identity::new(actor),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// The recorded outcome of a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub actor: Identity,
    pub comment: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approved
    }
}

/// A gate currently waiting for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    pub stage: StageId,
    pub approvers: BTreeSet<Identity>,
    pub note: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl PendingApproval {
    /// Whether `actor` may resolve this gate. An empty approver set admits anyone.
    pub fn admits(&self, actor: &Identity) -> bool {
        self.approvers.is_empty() || self.approvers.contains(actor)
    }
}

enum Gate {
    Unresolved {
        pending: PendingApproval,
        waiter: Option<oneshot::Sender<Verdict>>,
    },
    Resolved(Verdict),
    /// Run was cancelled while the gate was open.
    Withdrawn,
}

/// Registry of the approval gates of one pipeline run.
///
/// Cheap to clone; all clones share the same gates.
#[derive(Clone, Default)]
pub struct ApprovalBoard {
    gates: Arc<Mutex<HashMap<StageId, Gate>>>,
}

impl fmt::Debug for ApprovalBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalBoard")
            .field("pending", &self.pending().len())
            .finish()
    }
}

impl ApprovalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate for `stage` and return the receiver the engine awaits.
    ///
    /// Called once per stage; the topology rejects stages with two approvals.
    pub(crate) fn open(
        &self,
        stage: &StageId,
        approvers: BTreeSet<Identity>,
        note: Option<String>,
    ) -> oneshot::Receiver<Verdict> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            stage: stage.clone(),
            approvers,
            note,
            requested_at: Utc::now(),
        };
        self.lock().insert(
            stage.clone(),
            Gate::Unresolved {
                pending,
                waiter: Some(tx),
            },
        );
        rx
    }

    /// Record a decision on an open gate.
    ///
    /// # Errors
    ///
    /// - `UnknownStage` if `stage` has no open gate (never opened, or withdrawn)
    /// - `AlreadyResolved` if a decision was already recorded
    /// - `UnauthorizedActor` if the actor is not among the gate's approvers
    ///
    /// On error the gate is left untouched.
    pub fn resolve(&self, resolution: Resolution) -> Result<Verdict, ApprovalError> {
        let mut gates = self.lock();
        let gate = gates
            .get_mut(&resolution.stage)
            .ok_or_else(|| ApprovalError::UnknownStage(resolution.stage.clone()))?;

        match gate {
            Gate::Resolved(_) => Err(ApprovalError::AlreadyResolved(resolution.stage)),
            Gate::Withdrawn => Err(ApprovalError::UnknownStage(resolution.stage)),
            Gate::Unresolved { pending, waiter } => {
                if !pending.admits(&resolution.actor) {
                    return Err(ApprovalError::UnauthorizedActor {
                        stage: resolution.stage,
                        actor: resolution.actor.to_string(),
                    });
                }
                let verdict = Verdict {
                    decision: resolution.decision,
                    actor: resolution.actor,
                    comment: resolution.comment,
                    resolved_at: Utc::now(),
                };
                if let Some(tx) = waiter.take() {
                    // The engine may already have stopped listening (cancel).
                    let _ = tx.send(verdict.clone());
                }
                *gate = Gate::Resolved(verdict.clone());
                Ok(verdict)
            }
        }
    }

    /// Reject an unresolved gate on behalf of [`TIMEOUT_ACTOR`].
    ///
    /// Returns the gate's final verdict, which is the earlier decision if an
    /// actor got there first.
    pub(crate) fn expire(&self, stage: &StageId, after_secs: u64) -> Option<Verdict> {
        let mut gates = self.lock();
        let gate = gates.get_mut(stage)?;
        match gate {
            Gate::Resolved(verdict) => Some(verdict.clone()),
            Gate::Withdrawn => None,
            Gate::Unresolved { .. } => {
                let verdict = Verdict {
                    decision: Decision::Rejected,
                    actor: Identity::new(TIMEOUT_ACTOR),
                    comment: Some(format!("no decision within {after_secs}s")),
                    resolved_at: Utc::now(),
                };
                *gate = Gate::Resolved(verdict.clone());
                Some(verdict)
            }
        }
    }

    /// Close every unresolved gate; later resolution calls get `UnknownStage`.
    pub(crate) fn withdraw_all(&self) {
        for gate in self.lock().values_mut() {
            if matches!(gate, Gate::Unresolved { .. }) {
                *gate = Gate::Withdrawn;
            }
        }
    }

    /// Gates currently awaiting a decision, ordered by stage.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<_> = self
            .lock()
            .values()
            .filter_map(|gate| match gate {
                Gate::Unresolved { pending, .. } => Some(pending.clone()),
                _ => None,
            })
            .collect();
        pending.sort_by(|a, b| a.stage.cmp(&b.stage));
        pending
    }

    /// Verdict recorded for `stage`, if any.
    pub fn verdict(&self, stage: &StageId) -> Option<Verdict> {
        match self.lock().get(stage) {
            Some(Gate::Resolved(verdict)) => Some(verdict.clone()),
            _ => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StageId, Gate>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
