//! Approval request records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    /// Set only by an external timeout policy
    TimedOut,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Agent on whose behalf an approval is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Dev,
    Test,
    Security,
    Cicd,
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Agent::Dev => "dev",
            Agent::Test => "test",
            Agent::Security => "security",
            Agent::Cicd => "cicd",
        };
        f.write_str(s)
    }
}

/// Kind of action awaiting sign-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    DesignApproval,
    CodeChanges,
    TestGeneration,
    SecurityWarning,
    DeploymentStaging,
    DeploymentProd,
    Rollback,
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalAction::DesignApproval => "design_approval",
            ApprovalAction::CodeChanges => "code_changes",
            ApprovalAction::TestGeneration => "test_generation",
            ApprovalAction::SecurityWarning => "security_warning",
            ApprovalAction::DeploymentStaging => "deployment_staging",
            ApprovalAction::DeploymentProd => "deployment_prod",
            ApprovalAction::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// A request for human approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub agent: Agent,
    pub action: ApprovalAction,
    pub description: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub approver: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    /// Other half of a dual-approval pair, set on both halves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion_id: Option<Uuid>,
    /// When set, only these identities may approve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_approvers: Option<Vec<String>>,
}

impl ApprovalRequest {
    pub fn new(agent: Agent, action: ApprovalAction, description: impl Into<String>, details: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent,
            action,
            description: description.into(),
            details,
            created_at: Utc::now(),
            status: ApprovalStatus::Pending,
            approver: None,
            resolved_at: None,
            comments: None,
            companion_id: None,
            authorized_approvers: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Copy of this request moved to a terminal status
    pub(crate) fn resolved(&self, status: ApprovalStatus, approver: Option<String>, comments: Option<String>) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.approver = approver;
        next.comments = comments;
        next.resolved_at = Some(Utc::now());
        next
    }
}

/// A single answer obtained from a decision channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub approved: bool,
    pub approver: String,
    #[serde(default)]
    pub comments: Option<String>,
}

impl Decision {
    pub fn approve(approver: impl Into<String>) -> Self {
        Self {
            approved: true,
            approver: approver.into(),
            comments: None,
        }
    }

    pub fn reject(approver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            approver: approver.into(),
            comments: Some(reason.into()),
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_request_is_pending() {
        let request = ApprovalRequest::new(
            Agent::Dev,
            ApprovalAction::CodeChanges,
            "Dev completed: add login",
            json!({ "files_changed": ["src/login.rs"] }),
        );
        assert!(request.is_pending());
        assert!(request.approver.is_none());
        assert!(request.resolved_at.is_none());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let raw = serde_json::to_string(&ApprovalStatus::TimedOut).unwrap();
        assert_eq!(raw, "\"timed_out\"");
        assert!(ApprovalStatus::TimedOut.is_terminal());
        assert!(!ApprovalStatus::Pending.is_terminal());
    }

    #[test]
    fn test_resolved_copy_sets_timestamp() {
        let request = ApprovalRequest::new(Agent::Cicd, ApprovalAction::DeploymentStaging, "deploy", json!({}));
        let done = request.resolved(ApprovalStatus::Approved, Some("alice".into()), None);
        assert_eq!(done.status, ApprovalStatus::Approved);
        assert_eq!(done.approver.as_deref(), Some("alice"));
        assert!(done.resolved_at.is_some());
        assert!(request.is_pending());
    }
}
