//! The approval gate: request / approve / reject / status plus the
//! checkpoint protocols

use super::channel::{DecisionChannel, Solicitation};
use super::models::{Agent, ApprovalAction, ApprovalRequest, ApprovalStatus, Decision};
use super::store::{ApprovalStore, SwapOutcome};
use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Operational failures of the approval subsystem
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Approval request not found: {0}")]
    NotFound(Uuid),

    #[error("Approval request {id} is already {status}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },

    #[error("Approver refused: {0}")]
    ApproverRefused(String),

    #[error("Invalid approval input: {0}")]
    Validation(String),

    #[error("Approval storage unavailable: {0}")]
    Storage(String),

    #[error("Decision channel failure: {0}")]
    Channel(String),
}

/// Outcome of a single-approval checkpoint
#[derive(Debug, Clone)]
pub enum Verdict {
    Approved(ApprovalRequest),
    Rejected(ApprovalRequest),
}

/// Outcome of a dual-approval checkpoint
#[derive(Debug, Clone)]
pub enum DualVerdict {
    Approved {
        first: ApprovalRequest,
        second: ApprovalRequest,
    },
    /// Either half was rejected; carries the rejected request
    Rejected(ApprovalRequest),
}

impl DualVerdict {
    /// Approver identities, in approval order
    pub fn approvers(&self) -> Vec<String> {
        match self {
            DualVerdict::Approved { first, second } => [first, second]
                .iter()
                .filter_map(|r| r.approver.clone())
                .collect(),
            DualVerdict::Rejected(_) => Vec::new(),
        }
    }
}

/// Human-in-the-loop approval gate
#[derive(Clone)]
pub struct ApprovalGate {
    store: Arc<dyn ApprovalStore>,
    channel: Arc<dyn DecisionChannel>,
    audit: AuditLog,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn ApprovalStore>, channel: Arc<dyn DecisionChannel>, audit: AuditLog) -> Self {
        Self { store, channel, audit }
    }

    /// Create a pending request with a fresh identity
    pub async fn request(
        &self,
        agent: Agent,
        action: ApprovalAction,
        description: impl Into<String>,
        details: Value,
    ) -> Result<ApprovalRequest, GateError> {
        let request = ApprovalRequest::new(agent, action, description, details);
        self.persist_new(&request).await?;
        Ok(request)
    }

    async fn persist_new(&self, request: &ApprovalRequest) -> Result<(), GateError> {
        self.store.put(request).await?;

        self.audit
            .record(
                AuditEvent::new(AuditEventKind::ApprovalRequested, request.agent.to_string(), &request.description)
                    .with_details(json!({
                        "request_id": request.id,
                        "action": request.action,
                        "companion_id": request.companion_id,
                    })),
            )
            .await;
        Ok(())
    }

    pub async fn approve(
        &self,
        id: Uuid,
        approver: &str,
        comments: Option<String>,
    ) -> Result<ApprovalRequest, GateError> {
        self.resolve(id, ApprovalStatus::Approved, Some(approver), comments).await
    }

    pub async fn reject(
        &self,
        id: Uuid,
        approver: &str,
        comments: Option<String>,
    ) -> Result<ApprovalRequest, GateError> {
        self.resolve(id, ApprovalStatus::Rejected, Some(approver), comments).await
    }

    /// Hook for an external timeout policy
    pub async fn expire(&self, id: Uuid) -> Result<ApprovalRequest, GateError> {
        self.resolve(id, ApprovalStatus::TimedOut, None, Some("approval timed out".to_string()))
            .await
    }

    pub async fn status(&self, id: Uuid) -> Result<ApprovalRequest, GateError> {
        self.store.get(id).await?.ok_or(GateError::NotFound(id))
    }

    pub async fn pending(&self) -> Result<Vec<ApprovalRequest>, GateError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(ApprovalRequest::is_pending)
            .collect())
    }

    pub async fn list(&self) -> Result<Vec<ApprovalRequest>, GateError> {
        self.store.list().await
    }

    /// One-shot transition out of `pending`
    async fn resolve(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        approver: Option<&str>,
        comments: Option<String>,
    ) -> Result<ApprovalRequest, GateError> {
        let approver = match approver {
            Some(a) if a.trim().is_empty() => {
                return Err(GateError::Validation("approver identity must not be empty".to_string()))
            }
            Some(a) => Some(a.trim().to_string()),
            None => None,
        };

        let current = self.status(id).await?;
        if current.status.is_terminal() {
            return Err(GateError::AlreadyResolved {
                id,
                status: current.status,
            });
        }

        if status == ApprovalStatus::Approved {
            if let Some(approver) = approver.as_deref() {
                if let Some(reason) = self.refusal(&current, approver).await? {
                    warn!("Approval {}: {}", id, reason);
                    self.audit
                        .record(
                            AuditEvent::new(AuditEventKind::ApproverRefused, current.agent.to_string(), &reason)
                                .with_details(json!({
                                    "request_id": id,
                                    "companion_id": current.companion_id,
                                    "approver": approver,
                                })),
                        )
                        .await;
                    return Err(GateError::ApproverRefused(reason));
                }
            }
        }

        let updated = current.resolved(status, approver, comments);
        match self.store.compare_and_swap(ApprovalStatus::Pending, &updated).await? {
            SwapOutcome::Swapped => {}
            SwapOutcome::Missing => return Err(GateError::NotFound(id)),
            SwapOutcome::Conflict(now) => {
                return Err(GateError::AlreadyResolved { id, status: now.status })
            }
        }

        info!(
            "Approval {} ({} / {}) {} by {}",
            id,
            updated.agent,
            updated.action,
            status,
            updated.approver.as_deref().unwrap_or("policy")
        );

        self.audit
            .record(
                AuditEvent::new(
                    AuditEventKind::ApprovalResolved,
                    updated.agent.to_string(),
                    format!("{} {}", updated.action, status),
                )
                .with_details(json!({
                    "request_id": id,
                    "status": status,
                    "approver": updated.approver,
                    "comments": updated.comments,
                })),
            )
            .await;

        Ok(updated)
    }

    /// Why `approver` may not approve `request`: outside its authorized set,
    /// or already the approver of its companion
    async fn refusal(&self, request: &ApprovalRequest, approver: &str) -> Result<Option<String>, GateError> {
        let mut constraints = Solicitation {
            authorized_approvers: request.authorized_approvers.clone(),
            ..Solicitation::open()
        };
        if let Some(companion_id) = request.companion_id {
            if let Some(companion) = self.store.get(companion_id).await? {
                if companion.status == ApprovalStatus::Approved {
                    constraints.excluded_approvers.extend(companion.approver);
                }
            }
        }
        Ok(constraints.refusal(approver))
    }

    /// Point an approved first half at its second half
    async fn link_companion(&self, first: ApprovalRequest, second_id: Uuid) -> Result<ApprovalRequest, GateError> {
        let mut linked = first.clone();
        linked.companion_id = Some(second_id);
        match self.store.compare_and_swap(ApprovalStatus::Approved, &linked).await? {
            SwapOutcome::Swapped => Ok(linked),
            SwapOutcome::Missing | SwapOutcome::Conflict(_) => {
                warn!("Could not link approval {} to its companion {}", first.id, second_id);
                Ok(first)
            }
        }
    }

    /// Create a request, solicit one decision and apply it.
    ///
    /// A negative decision comes back as [`Verdict::Rejected`].
    pub async fn require_approval(
        &self,
        agent: Agent,
        action: ApprovalAction,
        description: impl Into<String>,
        details: Value,
    ) -> Result<Verdict, GateError> {
        let request = self.request(agent, action, description, details).await?;
        let decision = self.channel.solicit(&request, &Solicitation::open()).await?;
        self.apply(&request, decision).await
    }

    async fn apply(&self, request: &ApprovalRequest, decision: Decision) -> Result<Verdict, GateError> {
        if decision.approved {
            let approved = self.approve(request.id, &decision.approver, decision.comments).await?;
            Ok(Verdict::Approved(approved))
        } else {
            let rejected = self.reject(request.id, &decision.approver, decision.comments).await?;
            warn!("Approval {} ({}) rejected by {}", rejected.id, rejected.action, decision.approver);
            Ok(Verdict::Rejected(rejected))
        }
    }

    /// Two sequential approvals by distinct identities.
    ///
    /// After the first half is approved, the second is re-solicited until a
    /// different (and, when `authorized` is given, authorized) identity
    /// approves, or someone rejects. The refused attempts are audited and
    /// leave the second request pending.
    pub async fn require_dual_approval(
        &self,
        agent: Agent,
        action: ApprovalAction,
        description: &str,
        details: Value,
        authorized: Option<&[String]>,
    ) -> Result<DualVerdict, GateError> {
        let first_details = with_field(details.clone(), "approval", json!("1 of 2"));
        let first = self
            .request(agent, action, format!("{} (approval 1 of 2)", description), first_details)
            .await?;

        let decision = self.channel.solicit(&first, &Solicitation::open()).await?;
        let first = match self.apply(&first, decision).await? {
            Verdict::Approved(r) => r,
            Verdict::Rejected(r) => return Ok(DualVerdict::Rejected(r)),
        };
        let first_approver = first.approver.clone().unwrap_or_default();

        let mut second = ApprovalRequest::new(
            agent,
            action,
            format!("{} (approval 2 of 2)", description),
            with_field(details, "approval", json!("2 of 2")),
        );
        second.companion_id = Some(first.id);
        second.authorized_approvers = authorized.map(|a| a.to_vec());
        self.persist_new(&second).await?;
        let first = self.link_companion(first, second.id).await?;

        let mut solicitation = Solicitation {
            excluded_approvers: vec![first_approver],
            authorized_approvers: second.authorized_approvers.clone(),
            attempt: 1,
        };

        loop {
            let decision = self.channel.solicit(&second, &solicitation).await?;

            if decision.approved {
                if let Some(reason) = solicitation.refusal(decision.approver.trim()) {
                    warn!("Dual approval {}: {}", second.id, reason);
                    self.audit
                        .record(
                            AuditEvent::new(AuditEventKind::ApproverRefused, agent.to_string(), &reason).with_details(
                                json!({
                                    "request_id": second.id,
                                    "companion_id": first.id,
                                    "approver": decision.approver,
                                    "attempt": solicitation.attempt,
                                }),
                            ),
                        )
                        .await;
                    solicitation.attempt += 1;
                    continue;
                }
            }

            return match self.apply(&second, decision).await? {
                Verdict::Approved(second) => Ok(DualVerdict::Approved { first, second }),
                Verdict::Rejected(r) => Ok(DualVerdict::Rejected(r)),
            };
        }
    }
}

fn with_field(details: Value, key: &str, value: Value) -> Value {
    let mut map = match details {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("detail".to_string(), other);
            map
        }
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}
