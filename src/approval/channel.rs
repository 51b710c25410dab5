//! Decision channels
//!
//! A checkpoint needs someone to answer. The gate asks through a
//! [`DecisionChannel`]; which human-facing surface sits behind it is a
//! deployment choice.

use super::gate::GateError;
use super::models::{ApprovalRequest, Decision};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Constraints the answering approver must satisfy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Solicitation {
    /// Identities that may not approve this request
    pub excluded_approvers: Vec<String>,
    /// When set, only these identities may approve
    pub authorized_approvers: Option<Vec<String>>,
    /// 1 on the first ask, incremented on every re-prompt
    pub attempt: u32,
}

impl Solicitation {
    pub fn open() -> Self {
        Self {
            attempt: 1,
            ..Self::default()
        }
    }

    /// Why `approver` may not approve, if anything
    pub fn refusal(&self, approver: &str) -> Option<String> {
        if self.excluded_approvers.iter().any(|a| a == approver) {
            return Some(format!(
                "approver '{}' already approved the companion request; a different approver is required",
                approver
            ));
        }
        if let Some(authorized) = &self.authorized_approvers {
            if !authorized.iter().any(|a| a == approver) {
                return Some(format!("approver '{}' is not in the authorized approver set", approver));
            }
        }
        None
    }
}

#[async_trait]
pub trait DecisionChannel: Send + Sync {
    /// Obtain one decision for `request`. Blocks until answered.
    async fn solicit(&self, request: &ApprovalRequest, solicitation: &Solicitation) -> Result<Decision, GateError>;
}

/// Channel answering from a pre-loaded queue of decisions.
///
/// Used for unattended runs and tests. An empty queue is a channel failure,
/// never an implicit approval.
pub struct QueuedDecisionChannel {
    decisions: Mutex<VecDeque<Decision>>,
    solicited: Mutex<Vec<(Uuid, Solicitation)>>,
}

impl QueuedDecisionChannel {
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            solicited: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, decision: Decision) {
        self.decisions.lock().await.push_back(decision);
    }

    /// Every (request id, solicitation) asked so far, in order
    pub async fn solicited(&self) -> Vec<(Uuid, Solicitation)> {
        self.solicited.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.decisions.lock().await.len()
    }
}

#[async_trait]
impl DecisionChannel for QueuedDecisionChannel {
    async fn solicit(&self, request: &ApprovalRequest, solicitation: &Solicitation) -> Result<Decision, GateError> {
        self.solicited
            .lock()
            .await
            .push((request.id, solicitation.clone()));

        self.decisions
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| GateError::Channel(format!("no queued decision for approval {}", request.id)))
    }
}

struct Waiter {
    sender: oneshot::Sender<Decision>,
    solicitation: Solicitation,
}

/// Channel answered through the HTTP API.
///
/// `solicit` parks until `submit` delivers a decision for the same request
/// id. Decisions that violate the solicitation are refused at submit time so
/// the caller gets immediate feedback; the gate re-checks regardless.
pub struct HttpDecisionChannel {
    waiters: Mutex<HashMap<Uuid, Waiter>>,
}

impl HttpDecisionChannel {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a decision. Returns `Ok(false)` when nothing is waiting on `id`.
    pub async fn submit(&self, id: Uuid, decision: Decision) -> Result<bool, GateError> {
        let mut waiters = self.waiters.lock().await;

        let Some(waiter) = waiters.get(&id) else {
            return Ok(false);
        };

        if decision.approved {
            if let Some(reason) = waiter.solicitation.refusal(&decision.approver) {
                return Err(GateError::ApproverRefused(reason));
            }
        }

        let Some(waiter) = waiters.remove(&id) else {
            return Ok(false);
        };
        if waiter.sender.send(decision).is_err() {
            // The checkpoint was abandoned (run dropped); nothing left to resolve
            debug!("Decision for approval {} arrived after the waiter went away", id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Request ids currently parked on a decision
    pub async fn waiting(&self) -> Vec<Uuid> {
        self.waiters.lock().await.keys().copied().collect()
    }
}

impl Default for HttpDecisionChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionChannel for HttpDecisionChannel {
    async fn solicit(&self, request: &ApprovalRequest, solicitation: &Solicitation) -> Result<Decision, GateError> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.lock().await.insert(
            request.id,
            Waiter {
                sender,
                solicitation: solicitation.clone(),
            },
        );

        info!(
            "Awaiting decision for approval {} ({} / {}, attempt {})",
            request.id, request.agent, request.action, solicitation.attempt
        );

        receiver
            .await
            .map_err(|_| GateError::Channel(format!("decision channel closed for approval {}", request.id)))
    }
}
