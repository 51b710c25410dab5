//! Deployment governor
//!
//! Applies per-environment approval policy, calls the deploy collaborator
//! once per requested environment, and records a [`DeploymentRecord`] for
//! every attempt. A failed deploy to one environment never cancels the
//! others; a rejected approval stops the run.

use super::collaborators::{DeployCollaborator, DeployRequest, DeployResult};
use super::history::DeploymentHistory;
use super::types::{
    ApprovalPolicy, ArtifactRef, DeploymentKind, DeploymentOutcome, DeploymentRecord, Environment, PipelineRun,
    RunError, Stage, StageOutcome, WorkOutcome,
};
use crate::approval::{Agent, ApprovalAction, ApprovalGate, DualVerdict, GateError, Verdict};
use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const AUTO_APPROVER: &str = "auto-approved";

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid rollback request: {0}")]
    Validation(String),

    #[error("No previous successful version recorded for {0}")]
    NoPreviousVersion(Environment),

    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Approver identities synthesized when approvals are disabled
fn placeholder_approvers(policy: ApprovalPolicy) -> Vec<String> {
    match policy {
        ApprovalPolicy::None => Vec::new(),
        ApprovalPolicy::Single => vec![AUTO_APPROVER.to_string()],
        ApprovalPolicy::Dual => vec![format!("{}-1", AUTO_APPROVER), format!("{}-2", AUTO_APPROVER)],
    }
}

/// Refuse to deploy when the resolved approvers do not satisfy the policy
fn precheck(environment: Environment, approvers: &[String]) -> Result<(), String> {
    match environment.approval_policy() {
        ApprovalPolicy::None => Ok(()),
        ApprovalPolicy::Single if approvers.is_empty() => Err(format!(
            "{} deployment requires at least 1 approver",
            environment
        )),
        ApprovalPolicy::Single => Ok(()),
        ApprovalPolicy::Dual => {
            let distinct: BTreeSet<&String> = approvers.iter().collect();
            if distinct.len() < 2 {
                Err(format!("{} deployment requires 2 distinct approvers", environment))
            } else {
                Ok(())
            }
        }
    }
}

fn approval_action(environment: Environment) -> ApprovalAction {
    match environment {
        Environment::Prod => ApprovalAction::DeploymentProd,
        Environment::Dev | Environment::Staging => ApprovalAction::DeploymentStaging,
    }
}

pub struct DeploymentGovernor {
    gate: ApprovalGate,
    deployer: Arc<dyn DeployCollaborator>,
    history: Arc<DeploymentHistory>,
    audit: AuditLog,
    /// When set, the second prod approver must be one of these
    prod_approvers: Option<Vec<String>>,
}

impl DeploymentGovernor {
    pub fn new(
        gate: ApprovalGate,
        deployer: Arc<dyn DeployCollaborator>,
        history: Arc<DeploymentHistory>,
        audit: AuditLog,
    ) -> Self {
        Self {
            gate,
            deployer,
            history,
            audit,
            prod_approvers: None,
        }
    }

    pub fn with_prod_approvers(mut self, approvers: Vec<String>) -> Self {
        self.prod_approvers = if approvers.is_empty() { None } else { Some(approvers) };
        self
    }

    pub fn history(&self) -> &Arc<DeploymentHistory> {
        &self.history
    }

    /// Deploy `artifact` to each target in order.
    ///
    /// Appends one `Deployment` stage outcome. Returns an error only when an
    /// approval was rejected or the gate failed; the remaining targets are
    /// then skipped.
    pub async fn run(
        &self,
        run: &mut PipelineRun,
        targets: &[Environment],
        artifact: &ArtifactRef,
        require_approvals: bool,
    ) -> Result<(), RunError> {
        run.enter(Stage::Deployment);
        self.audit
            .record(
                AuditEvent::new(
                    AuditEventKind::StageEntered,
                    Stage::Deployment.as_str(),
                    format!("Deploying {} to {:?}", artifact.version, targets),
                )
                .for_run(run.id),
            )
            .await;

        let approvals_before = run.approvals.len();
        let result = self.deploy_all(run, targets, artifact, require_approvals).await;
        let approval_ids = run.approvals[approvals_before..].to_vec();

        let summary = run
            .deployments
            .iter()
            .map(|d| match &d.error {
                Some(e) => format!("{}: failed ({})", d.environment, e),
                None => format!("{}: success", d.environment),
            })
            .collect::<Vec<_>>()
            .join(", ");

        let outcome = match &result {
            Ok(()) => {
                let failures: Vec<String> = run
                    .deployments
                    .iter()
                    .filter(|d| !d.succeeded())
                    .map(|d| {
                        RunError::DeploymentPartialFailure {
                            environment: d.environment,
                            message: d.error.clone().unwrap_or_default(),
                        }
                        .to_string()
                    })
                    .collect();
                WorkOutcome {
                    content: summary,
                    changed_artifacts: Vec::new(),
                    success: failures.is_empty(),
                    error: (!failures.is_empty()).then(|| failures.join("; ")),
                }
            }
            Err(e) => WorkOutcome {
                content: summary,
                changed_artifacts: Vec::new(),
                success: false,
                error: Some(e.to_string()),
            },
        };

        let event = if outcome.success {
            AuditEventKind::StageCompleted
        } else {
            AuditEventKind::StageFailed
        };
        self.audit
            .record(AuditEvent::new(event, Stage::Deployment.as_str(), &outcome.content).for_run(run.id))
            .await;

        run.record(StageOutcome::new(Stage::Deployment, outcome).with_approvals(approval_ids))?;
        result
    }

    async fn deploy_all(
        &self,
        run: &mut PipelineRun,
        targets: &[Environment],
        artifact: &ArtifactRef,
        require_approvals: bool,
    ) -> Result<(), RunError> {
        let mut seen = BTreeSet::new();
        for &environment in targets {
            if !seen.insert(environment) {
                warn!("Ignoring duplicate deployment target {} for run {}", environment, run.id);
                continue;
            }

            info!("Deploying {} to {} (run {})", artifact.version, environment, run.short_id());
            let approvers = self
                .resolve_approvers(run, environment, artifact, require_approvals)
                .await?;

            let result = match precheck(environment, &approvers) {
                Err(reason) => {
                    warn!("Refusing to deploy to {}: {}", environment, reason);
                    DeployResult::failed(reason)
                }
                Ok(()) => {
                    let request = DeployRequest {
                        run_id: Some(run.id),
                        environment,
                        version: artifact.version.clone(),
                        hash: artifact.sha256.clone(),
                        approvers: approvers.clone(),
                    };
                    match self.deployer.deploy(&request).await {
                        Ok(result) => result,
                        Err(e) => DeployResult::failed(e.to_string()),
                    }
                }
            };

            let record = DeploymentRecord {
                id: Uuid::new_v4(),
                run_id: Some(run.id),
                environment,
                kind: DeploymentKind::Deploy,
                artifact_version: artifact.version.clone(),
                artifact_hash: artifact.sha256.clone(),
                approvers,
                outcome: if result.success {
                    DeploymentOutcome::Success
                } else {
                    DeploymentOutcome::Failed
                },
                error: if result.success {
                    None
                } else {
                    Some(result.error.unwrap_or_else(|| "deploy collaborator reported failure".to_string()))
                },
                previous_version: self.history.current_version(environment).await,
                timestamp: Utc::now(),
            };

            if let Some(message) = &record.error {
                warn!("Deployment to {} failed for run {}: {}", environment, run.id, message);
            } else {
                info!("Deployed {} to {}", record.artifact_version, environment);
            }

            self.persist(run.id, &record).await;
            run.deployments.push(record);
        }
        Ok(())
    }

    async fn persist(&self, run_id: Uuid, record: &DeploymentRecord) {
        if let Err(e) = self.history.append(record).await {
            error!("Failed to write deployment history for {}: {}", record.environment, e);
        }

        self.audit
            .record(
                AuditEvent::new(
                    AuditEventKind::Deployment,
                    record.environment.as_str(),
                    format!(
                        "{} {} to {}",
                        record.artifact_version,
                        if record.succeeded() { "deployed" } else { "failed" },
                        record.environment
                    ),
                )
                .for_run(run_id)
                .with_details(json!({
                    "environment": record.environment,
                    "version": record.artifact_version,
                    "sha256": record.artifact_hash,
                    "approvers": record.approvers,
                    "outcome": record.outcome,
                    "error": record.error,
                })),
            )
            .await;
    }

    async fn resolve_approvers(
        &self,
        run: &mut PipelineRun,
        environment: Environment,
        artifact: &ArtifactRef,
        require_approvals: bool,
    ) -> Result<Vec<String>, RunError> {
        let policy = environment.approval_policy();
        if !require_approvals {
            return Ok(placeholder_approvers(policy));
        }

        let description = format!("Deploy {} to {}: {}", artifact.version, environment, run.description);
        let details = json!({
            "run_id": run.id,
            "environment": environment,
            "version": artifact.version,
            "sha256": artifact.sha256,
        });
        let unavailable = |e: GateError| RunError::GateUnavailable {
            stage: Stage::Deployment,
            environment: Some(environment),
            message: e.to_string(),
        };

        let rejected = match policy {
            ApprovalPolicy::Single => {
                let verdict = self
                    .gate
                    .require_approval(Agent::Cicd, approval_action(environment), description, details)
                    .await
                    .map_err(unavailable)?;
                match verdict {
                    Verdict::Approved(request) => {
                        run.approvals.push(request.id);
                        return Ok(request.approver.into_iter().collect());
                    }
                    Verdict::Rejected(request) => request,
                }
            }
            ApprovalPolicy::Dual => {
                let verdict = self
                    .gate
                    .require_dual_approval(
                        Agent::Cicd,
                        approval_action(environment),
                        &description,
                        details,
                        self.prod_approvers.as_deref(),
                    )
                    .await
                    .map_err(unavailable)?;
                match verdict {
                    DualVerdict::Approved { first, second } => {
                        run.approvals.extend([first.id, second.id]);
                        return Ok([first.approver, second.approver].into_iter().flatten().collect());
                    }
                    DualVerdict::Rejected(request) => {
                        if let Some(companion) = request.companion_id {
                            run.approvals.push(companion);
                        }
                        request
                    }
                }
            }
            ApprovalPolicy::None => return Ok(Vec::new()),
        };

        run.approvals.push(rejected.id);
        warn!("Deployment to {} rejected for run {}", environment, run.id);
        Err(RunError::PolicyRejection {
            stage: Stage::Deployment,
            environment: Some(environment),
            approver: rejected.approver,
            reason: rejected.comments.unwrap_or_else(|| "no reason given".to_string()),
        })
    }

    /// Roll `environment` back to `target_version`, or to the most recent
    /// successful version before the current one.
    ///
    /// Always single-approval, prod included.
    pub async fn rollback(
        &self,
        environment: Environment,
        target_version: Option<&str>,
        reason: &str,
        approver: &str,
    ) -> Result<DeploymentRecord, DeployError> {
        if reason.trim().is_empty() {
            return Err(DeployError::Validation("rollback reason must not be empty".to_string()));
        }
        if approver.trim().is_empty() {
            return Err(DeployError::Validation("approver identity must not be empty".to_string()));
        }

        let current = self.history.current_version(environment).await;
        let target = match target_version {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => self
                .history
                .previous_version(environment)
                .await
                .ok_or(DeployError::NoPreviousVersion(environment))?,
        };

        let single_approval_gap = environment.approval_policy() == ApprovalPolicy::Dual;
        if single_approval_gap {
            warn!(
                "Rollback of {} to {} proceeds on a single approval; deploys to {} need two",
                environment, target, environment
            );
        }

        let request = self
            .gate
            .request(
                Agent::Cicd,
                ApprovalAction::Rollback,
                format!("Rollback {} to {}", environment, target),
                json!({
                    "environment": environment,
                    "from_version": current,
                    "to_version": target,
                    "reason": reason,
                }),
            )
            .await?;
        let approved = self.gate.approve(request.id, approver, Some(reason.to_string())).await?;

        let result = match self.deployer.rollback(environment, &target, reason, approver).await {
            Ok(result) => result,
            Err(e) => DeployResult::failed(e.to_string()),
        };

        let record = DeploymentRecord {
            id: Uuid::new_v4(),
            run_id: None,
            environment,
            kind: DeploymentKind::Rollback,
            artifact_hash: self.history.hash_of(environment, &target).await.unwrap_or_default(),
            artifact_version: target.clone(),
            approvers: approved.approver.clone().into_iter().collect(),
            outcome: if result.success {
                DeploymentOutcome::Success
            } else {
                DeploymentOutcome::Failed
            },
            error: if result.success {
                None
            } else {
                Some(result.error.unwrap_or_else(|| "rollback reported failure".to_string()))
            },
            previous_version: current.clone(),
            timestamp: Utc::now(),
        };

        if let Err(e) = self.history.append(&record).await {
            error!("Failed to write rollback history for {}: {}", environment, e);
        }

        self.audit
            .record(
                AuditEvent::new(
                    AuditEventKind::Rollback,
                    environment.as_str(),
                    format!(
                        "Rollback {} {} -> {}: {}",
                        environment,
                        current.as_deref().unwrap_or("unknown"),
                        target,
                        reason
                    ),
                )
                .with_details(json!({
                    "environment": environment,
                    "from_version": current,
                    "to_version": target,
                    "reason": reason,
                    "approver": approver,
                    "approval_id": approved.id,
                    "outcome": record.outcome,
                    "single_approval_policy_gap": single_approval_gap,
                })),
            )
            .await;

        if record.succeeded() {
            info!("Rolled back {} to {}", environment, target);
        } else {
            warn!("Rollback of {} to {} failed: {:?}", environment, target, record.error);
        }
        Ok(record)
    }
}
