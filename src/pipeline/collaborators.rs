//! Collaborator contracts
//!
//! Everything that actually performs work sits behind one of these traits.
//! The orchestrator and governor only sequence, gate, and record.

use super::security::parse_decision;
use super::types::{Environment, SecurityVerdict, WorkOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unreachable: {0}")]
    Transport(String),

    #[error("collaborator returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("collaborator not configured: {0}")]
    NotConfigured(String),

    #[error("invalid collaborator response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollaboratorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CollaboratorError::Timeout { .. })
    }
}

// =============================================================================
// WORK TASKS
// =============================================================================

/// What a work collaborator is asked to do. Dev tasks are routed by change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CreateDesign,
    ImplementFeature,
    FixBug,
    Refactor,
    Custom,
    GenerateTests,
    SecurityScan,
}

/// Upstream results handed to a downstream stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_design: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTask {
    /// Fresh per invocation
    pub id: String,
    pub kind: TaskKind,
    pub description: String,
    pub working_context: String,
    pub context: TaskContext,
}

#[async_trait]
pub trait WorkCollaborator: Send + Sync {
    async fn run(&self, task: &WorkTask) -> Result<WorkOutcome, CollaboratorError>;
}

/// Security scanning collaborator.
///
/// The default decision extraction reads the scan report; scanners with a
/// structured verdict override it.
#[async_trait]
pub trait SecurityCollaborator: Send + Sync {
    async fn scan(&self, task: &WorkTask) -> Result<WorkOutcome, CollaboratorError>;

    fn decision(&self, outcome: &WorkOutcome) -> SecurityVerdict {
        parse_decision(&outcome.content)
    }
}

// =============================================================================
// BUILD
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failure,
    Unstable,
    Aborted,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Pending => "PENDING",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::Failure => "FAILURE",
            BuildStatus::Unstable => "UNSTABLE",
            BuildStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

impl BuildStatus {
    pub fn from_result(result: Option<&str>, building: bool) -> Self {
        if building {
            return BuildStatus::Running;
        }
        match result {
            Some("SUCCESS") => BuildStatus::Success,
            Some("FAILURE") => BuildStatus::Failure,
            Some("UNSTABLE") => BuildStatus::Unstable,
            Some("ABORTED") => BuildStatus::Aborted,
            _ => BuildStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifact {
    pub file_name: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub job_name: String,
    pub build_number: u64,
    pub status: BuildStatus,
    pub duration_ms: u64,
    pub console_url: String,
    #[serde(default)]
    pub artifacts: Vec<BuildArtifact>,
}

#[async_trait]
pub trait BuildCollaborator: Send + Sync {
    /// Trigger `job` and wait for it to finish, giving up after `timeout`
    async fn trigger_and_wait(
        &self,
        job: &str,
        parameters: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<BuildInfo, CollaboratorError>;
}

// =============================================================================
// ARTIFACTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub repository: String,
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub md5: String,
    pub download_uri: String,
}

#[async_trait]
pub trait ArtifactCollaborator: Send + Sync {
    /// Upload `path` to `repository` (the collaborator's default when `None`)
    async fn upload(
        &self,
        path: &Path,
        repository: Option<&str>,
        target_path: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<ArtifactMetadata, CollaboratorError>;
}

// =============================================================================
// DEPLOY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub run_id: Option<Uuid>,
    pub environment: Environment,
    pub version: String,
    pub hash: String,
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeployResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait DeployCollaborator: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployResult, CollaboratorError>;

    async fn rollback(
        &self,
        environment: Environment,
        target_version: &str,
        reason: &str,
        approver: &str,
    ) -> Result<DeployResult, CollaboratorError>;
}

/// The set of collaborators one orchestrator drives.
///
/// Build and artifact collaborators are optional; requesting a build or an
/// upload without one configured fails that stage.
#[derive(Clone)]
pub struct Collaborators {
    pub design: Arc<dyn WorkCollaborator>,
    pub dev: Arc<dyn WorkCollaborator>,
    pub test: Arc<dyn WorkCollaborator>,
    pub security: Arc<dyn SecurityCollaborator>,
    pub build: Option<Arc<dyn BuildCollaborator>>,
    pub artifact: Option<Arc<dyn ArtifactCollaborator>>,
    pub deploy: Arc<dyn DeployCollaborator>,
}
