//! Shared types for the governance pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// CHANGE KIND & STAGES
// =============================================================================

/// Kind of change a run carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Feature,
    Bugfix,
    Refactor,
    Custom,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Feature => "feature",
            ChangeKind::Bugfix => "bugfix",
            ChangeKind::Refactor => "refactor",
            ChangeKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Pipeline stages. `Blocked` and `Failed` are absorbing terminal states
/// outside the canonical ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Design,
    DesignApproval,
    Dev,
    DevApproval,
    Test,
    TestApproval,
    Security,
    SecurityGate,
    Build,
    ArtifactUpload,
    Deployment,
    Complete,
    Blocked,
    Failed,
}

impl Stage {
    /// Canonical ordering every run's outcomes must be a subsequence of
    pub const ORDER: [Stage; 12] = [
        Stage::Design,
        Stage::DesignApproval,
        Stage::Dev,
        Stage::DevApproval,
        Stage::Test,
        Stage::TestApproval,
        Stage::Security,
        Stage::SecurityGate,
        Stage::Build,
        Stage::ArtifactUpload,
        Stage::Deployment,
        Stage::Complete,
    ];

    pub fn position(&self) -> Option<usize> {
        Self::ORDER.iter().position(|s| s == self)
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(
            self,
            Stage::DesignApproval | Stage::DevApproval | Stage::TestApproval | Stage::SecurityGate
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Design => "design",
            Stage::DesignApproval => "design_approval",
            Stage::Dev => "dev",
            Stage::DevApproval => "dev_approval",
            Stage::Test => "test",
            Stage::TestApproval => "test_approval",
            Stage::Security => "security",
            Stage::SecurityGate => "security_gate",
            Stage::Build => "build",
            Stage::ArtifactUpload => "artifact_upload",
            Stage::Deployment => "deployment",
            Stage::Complete => "complete",
            Stage::Blocked => "blocked",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Blocked,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

// =============================================================================
// ENVIRONMENTS
// =============================================================================

/// Deployment target environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

/// How many sign-offs an environment needs before deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    None,
    Single,
    /// Two approvals from distinct identities
    Dual,
}

impl Environment {
    pub fn approval_policy(&self) -> ApprovalPolicy {
        match self {
            Environment::Dev => ApprovalPolicy::None,
            Environment::Staging => ApprovalPolicy::Single,
            Environment::Prod => ApprovalPolicy::Dual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Uniform result returned by every work collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOutcome {
    pub content: String,
    #[serde(default)]
    pub changed_artifacts: Vec<String>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            changed_artifacts: Vec::new(),
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            changed_artifacts: Vec::new(),
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.changed_artifacts = artifacts;
        self
    }
}

/// One per attempted stage, never mutated after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    pub stage: Stage,
    pub result: WorkOutcome,
    pub timestamp: DateTime<Utc>,
    /// Approval requests resolved at this stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approval_ids: Vec<Uuid>,
}

impl StageOutcome {
    pub fn new(stage: Stage, result: WorkOutcome) -> Self {
        Self {
            stage,
            result,
            timestamp: Utc::now(),
            approval_ids: Vec::new(),
        }
    }

    pub fn with_approvals(mut self, ids: Vec<Uuid>) -> Self {
        self.approval_ids = ids;
        self
    }
}

/// Security scan classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityDecision {
    Block,
    Warn,
    Approve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityVerdict {
    pub decision: SecurityDecision,
    /// Non-empty only for `Block` (and for the undecidable-output `Warn`)
    pub blocking_reasons: Vec<String>,
}

// =============================================================================
// DEPLOYMENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Deploy,
    Rollback,
}

/// One per (run, environment); append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub environment: Environment,
    pub kind: DeploymentKind,
    pub artifact_version: String,
    pub artifact_hash: String,
    /// Distinct approver identities actually used, in approval order
    pub approvers: Vec<String>,
    pub outcome: DeploymentOutcome,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == DeploymentOutcome::Success
    }
}

/// Version and checksum of the artifact a run deploys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub version: String,
    pub sha256: String,
}

// =============================================================================
// ERRORS
// =============================================================================

fn scope(environment: &Option<Environment>) -> String {
    environment.map(|e| format!(" ({})", e)).unwrap_or_default()
}

/// Why a run stopped, or why one environment's deployment failed
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    /// A human or gate said no
    #[error("{stage}{} rejected by {}: {reason}", scope(.environment), .approver.as_deref().unwrap_or("unknown"))]
    PolicyRejection {
        stage: Stage,
        environment: Option<Environment>,
        approver: Option<String>,
        reason: String,
    },

    /// A worker returned success=false or raised
    #[error("{stage} failed: {message}")]
    CollaboratorFailure { stage: Stage, message: String },

    /// The approval subsystem broke; never treated as approved or rejected
    #[error("Approval gate unavailable at {stage}{}: {message}", scope(.environment))]
    GateUnavailable {
        stage: Stage,
        environment: Option<Environment>,
        message: String,
    },

    /// Hard security stop, no approval can override it
    #[error("Security gate blocked: {}", .reasons.join(", "))]
    SecurityBlock { reasons: Vec<String> },

    /// One environment's deploy failed; recorded, never escalated
    #[error("Deployment to {environment} failed: {message}")]
    DeploymentPartialFailure { environment: Environment, message: String },
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::PolicyRejection { .. } => "policy_rejection",
            RunError::CollaboratorFailure { .. } => "collaborator_failure",
            RunError::GateUnavailable { .. } => "gate_unavailable",
            RunError::SecurityBlock { .. } => "security_block",
            RunError::DeploymentPartialFailure { .. } => "deployment_partial_failure",
        }
    }
}

/// A stage outcome arrived out of canonical order
#[derive(Debug, Error)]
#[error("stage {stage} recorded after {after}")]
pub struct OrderingViolation {
    pub stage: Stage,
    pub after: Stage,
}

impl From<OrderingViolation> for RunError {
    fn from(violation: OrderingViolation) -> Self {
        RunError::CollaboratorFailure {
            stage: violation.stage,
            message: violation.to_string(),
        }
    }
}

// =============================================================================
// PIPELINE RUN
// =============================================================================

/// A single execution of the pipeline.
///
/// Mutated only by the orchestrator task driving it; frozen once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: Uuid,
    pub description: String,
    pub change_kind: ChangeKind,
    pub stage: Stage,
    pub outcomes: Vec<StageOutcome>,
    pub approvals: Vec<Uuid>,
    pub status: RunStatus,
    pub error: Option<RunError>,
    pub security: Option<SecurityVerdict>,
    pub build_number: Option<u64>,
    pub artifact: Option<ArtifactRef>,
    pub deployments: Vec<DeploymentRecord>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(description: impl Into<String>, change_kind: ChangeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            change_kind,
            stage: Stage::ORDER[0],
            outcomes: Vec::new(),
            approvals: Vec::new(),
            status: RunStatus::Running,
            error: None,
            security: None,
            build_number: None,
            artifact: None,
            deployments: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Short id used to derive collaborator task ids
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub fn task_id(&self, stage: Stage) -> String {
        format!("pipeline-{}-{}", self.short_id(), stage)
    }

    pub fn enter(&mut self, stage: Stage) {
        if !self.status.is_terminal() {
            self.stage = stage;
        }
    }

    /// Append an outcome, refusing anything that breaks canonical order
    pub fn record(&mut self, outcome: StageOutcome) -> Result<(), OrderingViolation> {
        if let Some(last) = self.outcomes.last() {
            let ordered = match (last.stage.position(), outcome.stage.position()) {
                (Some(prev), Some(next)) => next > prev,
                _ => false,
            };
            if !ordered {
                return Err(OrderingViolation {
                    stage: outcome.stage,
                    after: last.stage,
                });
            }
        } else if outcome.stage.position().is_none() {
            return Err(OrderingViolation {
                stage: outcome.stage,
                after: outcome.stage,
            });
        }
        self.outcomes.push(outcome);
        Ok(())
    }

    pub fn recorded_stages(&self) -> Vec<Stage> {
        self.outcomes.iter().map(|o| o.stage).collect()
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }

    /// Per-environment success map
    pub fn deployment_results(&self) -> BTreeMap<Environment, bool> {
        self.deployments
            .iter()
            .filter(|d| d.kind == DeploymentKind::Deploy)
            .map(|d| (d.environment, d.succeeded()))
            .collect()
    }

    pub fn deployment(&self, environment: Environment) -> Option<&DeploymentRecord> {
        self.deployments.iter().find(|d| d.environment == environment)
    }

    pub fn complete(&mut self) {
        self.finish(RunStatus::Complete, Stage::Complete, None);
    }

    pub fn block(&mut self, reasons: Vec<String>) {
        self.finish(RunStatus::Blocked, Stage::Blocked, Some(RunError::SecurityBlock { reasons }));
    }

    pub fn fail(&mut self, error: RunError) {
        self.finish(RunStatus::Failed, Stage::Failed, Some(error));
    }

    fn finish(&mut self, status: RunStatus, stage: Stage, error: Option<RunError>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.stage = stage;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}
