//! Pipeline orchestrator
//!
//! Drives one run through the fixed stage ordering, gating risk-bearing
//! transitions on the approval gate and stopping at the first rejection,
//! collaborator failure, gate failure or security block.

use super::collaborators::{
    BuildStatus, Collaborators, TaskContext, TaskKind, WorkCollaborator, WorkTask,
};
use super::deployment::DeploymentGovernor;
use super::registry::RunRegistry;
use super::types::{
    ArtifactRef, ChangeKind, Environment, PipelineRun, RunError, SecurityDecision, SecurityVerdict, Stage,
    StageOutcome, WorkOutcome,
};
use crate::approval::{Agent, ApprovalAction, ApprovalGate, Verdict};
use crate::audit::{truncate_summary, AuditEvent, AuditEventKind, AuditLog};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default wait for a build to finish
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Artifact version used when nothing was built or uploaded
pub const UNVERSIONED: &str = "latest";

/// Parameters of one pipeline run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub description: String,
    pub change_kind: ChangeKind,
    pub working_context: String,
    pub require_approvals: bool,
    pub skip_design: bool,
    /// Environments to deploy to after the security gate, in order
    pub deploy_to: Vec<Environment>,
    pub build_job: Option<String>,
    pub artifact_path: Option<PathBuf>,
    /// Overrides the artifact collaborator's default repository
    pub artifact_repository: Option<String>,
}

impl RunRequest {
    pub fn new(description: impl Into<String>, change_kind: ChangeKind) -> Self {
        Self {
            description: description.into(),
            change_kind,
            working_context: ".".to_string(),
            require_approvals: true,
            skip_design: false,
            deploy_to: Vec::new(),
            build_job: None,
            artifact_path: None,
            artifact_repository: None,
        }
    }
}

fn excerpt(text: &str, cap: usize) -> String {
    truncate_summary(text, cap)
}

pub struct PipelineOrchestrator {
    collaborators: Collaborators,
    gate: ApprovalGate,
    governor: Arc<DeploymentGovernor>,
    audit: AuditLog,
    registry: Arc<RunRegistry>,
    build_timeout: Duration,
}

impl PipelineOrchestrator {
    pub fn new(
        collaborators: Collaborators,
        gate: ApprovalGate,
        governor: Arc<DeploymentGovernor>,
        audit: AuditLog,
        registry: Arc<RunRegistry>,
    ) -> Self {
        Self {
            collaborators,
            gate,
            governor,
            audit,
            registry,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Execute a change request end to end and return the terminal run
    pub async fn run(&self, request: RunRequest) -> PipelineRun {
        let run = PipelineRun::new(&request.description, request.change_kind);
        self.execute(run, request).await
    }

    /// Drive a run the caller already created (and may have published)
    pub async fn execute(&self, mut run: PipelineRun, request: RunRequest) -> PipelineRun {
        info!(
            "Pipeline {} started: {} ({})",
            run.short_id(),
            run.description,
            run.change_kind
        );
        self.audit
            .record(
                AuditEvent::new(AuditEventKind::RunStarted, "pipeline", &run.description)
                    .for_run(run.id)
                    .with_details(json!({
                        "change_kind": run.change_kind,
                        "require_approvals": request.require_approvals,
                        "skip_design": request.skip_design,
                        "deploy_to": request.deploy_to,
                        "build_job": request.build_job,
                    })),
            )
            .await;
        self.registry.publish(&run).await;

        match self.drive(&mut run, &request).await {
            Ok(()) => {
                run.complete();
                info!("Pipeline {} complete", run.short_id());
                self.audit
                    .record(
                        AuditEvent::new(AuditEventKind::RunCompleted, "pipeline", "Pipeline complete")
                            .for_run(run.id)
                            .with_details(json!({ "deployments": run.deployment_results() })),
                    )
                    .await;
            }
            Err(RunError::SecurityBlock { reasons }) => {
                warn!("Pipeline {} blocked: {}", run.short_id(), reasons.join(", "));
                run.block(reasons);
                let summary = run.error.as_ref().map(ToString::to_string).unwrap_or_default();
                self.audit
                    .record(AuditEvent::new(AuditEventKind::RunBlocked, "pipeline", summary).for_run(run.id))
                    .await;
            }
            Err(error) => {
                warn!("Pipeline {} failed: {}", run.short_id(), error);
                self.audit
                    .record(
                        AuditEvent::new(AuditEventKind::RunFailed, "pipeline", error.to_string())
                            .for_run(run.id)
                            .with_details(json!({ "error": error })),
                    )
                    .await;
                run.fail(error);
            }
        }

        self.registry.publish(&run).await;
        run
    }

    async fn drive(&self, run: &mut PipelineRun, request: &RunRequest) -> Result<(), RunError> {
        let approvals = request.require_approvals;

        let design = if run.change_kind == ChangeKind::Feature && !request.skip_design {
            let task = self.task(run, Stage::Design, TaskKind::CreateDesign, request, TaskContext::default());
            let design = self.work(run, Stage::Design, self.collaborators.design.as_ref(), &task).await?;
            self.checkpoint(
                run,
                Stage::DesignApproval,
                approvals,
                Agent::Dev,
                ApprovalAction::DesignApproval,
                format!("Design ready for: {}", request.description),
                json!({
                    "task_id": task.id,
                    "design": excerpt(&design.content, 500),
                }),
            )
            .await?;
            Some(design.content)
        } else {
            debug!("Pipeline {}: no design stage for {}", run.short_id(), run.change_kind);
            None
        };

        let dev_kind = match run.change_kind {
            ChangeKind::Feature => TaskKind::ImplementFeature,
            ChangeKind::Bugfix => TaskKind::FixBug,
            ChangeKind::Refactor => TaskKind::Refactor,
            ChangeKind::Custom => TaskKind::Custom,
        };
        let context = TaskContext {
            approved_design: design,
            ..TaskContext::default()
        };
        let task = self.task(run, Stage::Dev, dev_kind, request, context);
        let dev = self.work(run, Stage::Dev, self.collaborators.dev.as_ref(), &task).await?;
        self.checkpoint(
            run,
            Stage::DevApproval,
            approvals,
            Agent::Dev,
            ApprovalAction::CodeChanges,
            format!("Dev completed: {}", request.description),
            json!({
                "task_id": task.id,
                "files_changed": dev.changed_artifacts,
                "summary": excerpt(&dev.content, 500),
            }),
        )
        .await?;

        let context = TaskContext {
            approved_design: None,
            upstream_content: Some(dev.content.clone()),
            files: dev.changed_artifacts.clone(),
        };
        let task = self.task(run, Stage::Test, TaskKind::GenerateTests, request, context);
        let test = self.work(run, Stage::Test, self.collaborators.test.as_ref(), &task).await?;
        self.checkpoint(
            run,
            Stage::TestApproval,
            approvals,
            Agent::Test,
            ApprovalAction::TestGeneration,
            format!("Tests generated for: {}", request.description),
            json!({
                "task_id": task.id,
                "test_files": test.changed_artifacts,
                "summary": excerpt(&test.content, 300),
            }),
        )
        .await?;

        let files: BTreeSet<String> = dev
            .changed_artifacts
            .iter()
            .chain(test.changed_artifacts.iter())
            .cloned()
            .collect();
        let context = TaskContext {
            approved_design: None,
            upstream_content: Some(format!(
                "Dev changes:\n{}\n\nTest changes:\n{}",
                excerpt(&dev.content, 500),
                excerpt(&test.content, 500)
            )),
            files: files.into_iter().collect(),
        };
        let task = self.task(run, Stage::Security, TaskKind::SecurityScan, request, context);
        let verdict = self.security(run, &task).await?;
        self.security_gate(run, approvals, &verdict, &task, request).await?;

        if let Some(job) = &request.build_job {
            self.build(run, job).await?;
        }

        let artifact = match &request.artifact_path {
            Some(path) => self.upload(run, path, request.artifact_repository.as_deref()).await?,
            None => ArtifactRef {
                version: run
                    .build_number
                    .map(|n| format!("1.0.{}", n))
                    .unwrap_or_else(|| UNVERSIONED.to_string()),
                sha256: String::new(),
            },
        };
        run.artifact = Some(artifact.clone());

        if !request.deploy_to.is_empty() {
            self.governor
                .run(run, &request.deploy_to, &artifact, approvals)
                .await?;
            self.registry.publish(run).await;
        }

        Ok(())
    }

    fn task(
        &self,
        run: &PipelineRun,
        stage: Stage,
        kind: TaskKind,
        request: &RunRequest,
        context: TaskContext,
    ) -> WorkTask {
        WorkTask {
            id: format!("{}-{}", run.task_id(stage), &Uuid::new_v4().simple().to_string()[..6]),
            kind,
            description: request.description.clone(),
            working_context: request.working_context.clone(),
            context,
        }
    }

    async fn enter(&self, run: &mut PipelineRun, stage: Stage) {
        run.enter(stage);
        debug!("Pipeline {} entering {}", run.short_id(), stage);
        self.audit
            .record(AuditEvent::new(AuditEventKind::StageEntered, stage.as_str(), format!("Entering {}", stage)).for_run(run.id))
            .await;
        self.registry.publish(run).await;
    }

    /// Append the outcome of `stage` and log the stage exit
    async fn append(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        outcome: WorkOutcome,
        approval_ids: Vec<Uuid>,
    ) -> Result<(), RunError> {
        let (event, summary) = if outcome.success {
            (AuditEventKind::StageCompleted, outcome.content.clone())
        } else {
            (
                AuditEventKind::StageFailed,
                outcome.error.clone().unwrap_or_else(|| outcome.content.clone()),
            )
        };
        let changed = outcome.changed_artifacts.clone();

        run.record(StageOutcome::new(stage, outcome).with_approvals(approval_ids))?;
        self.audit
            .record(
                AuditEvent::new(event, stage.as_str(), summary)
                    .for_run(run.id)
                    .with_details(json!({ "changed_artifacts": changed })),
            )
            .await;
        self.registry.publish(run).await;
        Ok(())
    }

    /// Record a collaborator result; anything but success stops the run
    async fn conclude(&self, run: &mut PipelineRun, stage: Stage, outcome: WorkOutcome) -> Result<WorkOutcome, RunError> {
        self.append(run, stage, outcome.clone(), Vec::new()).await?;
        if outcome.success {
            info!("Pipeline {}: {} succeeded", run.short_id(), stage);
            Ok(outcome)
        } else {
            let message = outcome
                .error
                .unwrap_or_else(|| "collaborator reported failure".to_string());
            Err(RunError::CollaboratorFailure { stage, message })
        }
    }

    /// Record a failed outcome for `stage` and return the matching error
    async fn fail_stage(&self, run: &mut PipelineRun, stage: Stage, message: String) -> RunError {
        match self.append(run, stage, WorkOutcome::failed(&message), Vec::new()).await {
            Ok(()) => RunError::CollaboratorFailure { stage, message },
            Err(e) => e,
        }
    }

    async fn work(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        collaborator: &dyn WorkCollaborator,
        task: &WorkTask,
    ) -> Result<WorkOutcome, RunError> {
        self.enter(run, stage).await;
        let outcome = match collaborator.run(task).await {
            Ok(outcome) => outcome,
            Err(e) => WorkOutcome::failed(e.to_string()),
        };
        self.conclude(run, stage, outcome).await
    }

    async fn security(&self, run: &mut PipelineRun, task: &WorkTask) -> Result<SecurityVerdict, RunError> {
        self.enter(run, Stage::Security).await;
        let scanner = &self.collaborators.security;
        let outcome = match scanner.scan(task).await {
            Ok(outcome) => outcome,
            Err(e) => WorkOutcome::failed(e.to_string()),
        };
        let outcome = self.conclude(run, Stage::Security, outcome).await?;

        let verdict = scanner.decision(&outcome);
        info!(
            "Pipeline {}: security decision {:?} {:?}",
            run.short_id(),
            verdict.decision,
            verdict.blocking_reasons
        );
        run.security = Some(verdict.clone());
        Ok(verdict)
    }

    async fn security_gate(
        &self,
        run: &mut PipelineRun,
        require_approvals: bool,
        verdict: &SecurityVerdict,
        task: &WorkTask,
        request: &RunRequest,
    ) -> Result<(), RunError> {
        match verdict.decision {
            SecurityDecision::Block => {
                self.enter(run, Stage::SecurityGate).await;
                let reasons = verdict.blocking_reasons.clone();
                let outcome = WorkOutcome {
                    content: reasons.join("\n"),
                    changed_artifacts: Vec::new(),
                    success: false,
                    error: Some("security scan returned BLOCK".to_string()),
                };
                self.append(run, Stage::SecurityGate, outcome, Vec::new()).await?;
                Err(RunError::SecurityBlock { reasons })
            }
            SecurityDecision::Warn => {
                self.checkpoint(
                    run,
                    Stage::SecurityGate,
                    require_approvals,
                    Agent::Security,
                    ApprovalAction::SecurityWarning,
                    format!("Security warnings for: {}", request.description),
                    json!({
                        "task_id": task.id,
                        "decision": verdict.decision,
                        "reasons": verdict.blocking_reasons,
                        "files": task.context.files,
                    }),
                )
                .await
            }
            SecurityDecision::Approve => {
                self.enter(run, Stage::SecurityGate).await;
                self.append(run, Stage::SecurityGate, WorkOutcome::ok("Security scan approved"), Vec::new())
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn checkpoint(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        require_approvals: bool,
        agent: Agent,
        action: ApprovalAction,
        description: String,
        details: Value,
    ) -> Result<(), RunError> {
        self.enter(run, stage).await;

        if !require_approvals {
            debug!("Pipeline {}: {} not gated", run.short_id(), stage);
            return self
                .append(run, stage, WorkOutcome::ok("Approval not required"), Vec::new())
                .await;
        }

        let verdict = match self.gate.require_approval(agent, action, description, details).await {
            Ok(verdict) => verdict,
            Err(e) => {
                let message = e.to_string();
                self.append(run, stage, WorkOutcome::failed(&message), Vec::new()).await?;
                return Err(RunError::GateUnavailable {
                    stage,
                    environment: None,
                    message,
                });
            }
        };

        match verdict {
            Verdict::Approved(request) => {
                run.approvals.push(request.id);
                let approver = request.approver.unwrap_or_default();
                self.append(
                    run,
                    stage,
                    WorkOutcome::ok(format!("Approved by {}", approver)),
                    vec![request.id],
                )
                .await
            }
            Verdict::Rejected(request) => {
                run.approvals.push(request.id);
                let reason = request
                    .comments
                    .clone()
                    .unwrap_or_else(|| "no reason given".to_string());
                let outcome = WorkOutcome::failed(format!(
                    "Rejected by {}: {}",
                    request.approver.as_deref().unwrap_or("unknown"),
                    reason
                ));
                self.append(run, stage, outcome, vec![request.id]).await?;
                Err(RunError::PolicyRejection {
                    stage,
                    environment: None,
                    approver: request.approver,
                    reason,
                })
            }
        }
    }

    async fn build(&self, run: &mut PipelineRun, job: &str) -> Result<(), RunError> {
        self.enter(run, Stage::Build).await;

        let Some(builder) = &self.collaborators.build else {
            let message = format!("no build collaborator configured for job {}", job);
            return Err(self.fail_stage(run, Stage::Build, message).await);
        };

        let mut parameters = BTreeMap::new();
        parameters.insert("PIPELINE_ID".to_string(), run.id.to_string());
        parameters.insert("CHANGE_DESCRIPTION".to_string(), excerpt(&run.description, 200));

        self.audit
            .record(
                AuditEvent::new(AuditEventKind::BuildTriggered, Stage::Build.as_str(), format!("Triggering {}", job))
                    .for_run(run.id)
                    .with_details(json!({ "job": job, "parameters": parameters })),
            )
            .await;

        let outcome = match builder.trigger_and_wait(job, &parameters, self.build_timeout).await {
            Ok(build) if build.status == BuildStatus::Success => {
                run.build_number = Some(build.build_number);
                WorkOutcome::ok(format!(
                    "Build #{} of {} succeeded in {} ms ({})",
                    build.build_number, build.job_name, build.duration_ms, build.console_url
                ))
                .with_artifacts(build.artifacts.into_iter().map(|a| a.relative_path).collect())
            }
            Ok(build) => WorkOutcome::failed(format!(
                "Build #{} of {} finished {} ({})",
                build.build_number, build.job_name, build.status, build.console_url
            )),
            Err(e) => {
                if e.is_timeout() {
                    warn!("Pipeline {}: build {} timed out", run.short_id(), job);
                }
                WorkOutcome::failed(e.to_string())
            }
        };

        self.conclude(run, Stage::Build, outcome).await.map(|_| ())
    }

    async fn upload(
        &self,
        run: &mut PipelineRun,
        path: &Path,
        repository: Option<&str>,
    ) -> Result<ArtifactRef, RunError> {
        self.enter(run, Stage::ArtifactUpload).await;

        let Some(store) = &self.collaborators.artifact else {
            let message = "no artifact collaborator configured".to_string();
            return Err(self.fail_stage(run, Stage::ArtifactUpload, message).await);
        };

        let version = match run.build_number {
            Some(n) => format!("1.0.{}", n),
            None => format!("1.0.{}", run.created_at.timestamp()),
        };
        let target_path = format!("pipeline-{}/{}", run.short_id(), version);
        let mut properties = BTreeMap::new();
        properties.insert("version".to_string(), version.clone());
        properties.insert("pipeline_id".to_string(), run.id.to_string());
        if let Some(n) = run.build_number {
            properties.insert("build_number".to_string(), n.to_string());
        }

        let meta = match store
            .upload(path, repository, &target_path, &properties)
            .await
        {
            Ok(meta) => meta,
            Err(e) => return Err(self.fail_stage(run, Stage::ArtifactUpload, e.to_string()).await),
        };
        let outcome = WorkOutcome::ok(format!(
            "Uploaded {} ({} bytes) to {}, sha256 {}",
            meta.path, meta.size_bytes, meta.repository, meta.sha256
        ))
        .with_artifacts(vec![meta.download_uri.clone()]);
        self.conclude(run, Stage::ArtifactUpload, outcome).await?;

        self.audit
            .record(
                AuditEvent::new(
                    AuditEventKind::ArtifactUploaded,
                    Stage::ArtifactUpload.as_str(),
                    format!("{} {}", meta.path, version),
                )
                .for_run(run.id)
                .with_details(json!({
                    "repository": meta.repository,
                    "path": meta.path,
                    "size_bytes": meta.size_bytes,
                    "sha256": meta.sha256,
                    "md5": meta.md5,
                })),
            )
            .await;

        Ok(ArtifactRef {
            version,
            sha256: meta.sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalStatus, Decision};
    use crate::audit::{AuditFilter, AuditSink};
    use crate::pipeline::types::RunStatus;
    use crate::testing::{Harness, ScriptedArtifact, ScriptedBuild, ScriptedWorker, BLOCK_REPORT, WARN_REPORT};
    use pretty_assertions::assert_eq;

    fn unattended(kind: ChangeKind) -> RunRequest {
        RunRequest {
            require_approvals: false,
            ..RunRequest::new("Add login page", kind)
        }
    }

    fn is_canonical(stages: &[Stage]) -> bool {
        stages
            .windows(2)
            .all(|w| matches!((w[0].position(), w[1].position()), (Some(a), Some(b)) if a < b))
    }

    #[tokio::test]
    async fn test_feature_without_approvals_completes_with_eight_outcomes() {
        let harness = Harness::builder().finish();
        let run = harness.orchestrator.run(unattended(ChangeKind::Feature)).await;

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.stage, Stage::Complete);
        assert_eq!(
            run.recorded_stages(),
            vec![
                Stage::Design,
                Stage::DesignApproval,
                Stage::Dev,
                Stage::DevApproval,
                Stage::Test,
                Stage::TestApproval,
                Stage::Security,
                Stage::SecurityGate,
            ]
        );
        assert!(run.approvals.is_empty());
        assert!(harness.gate.list().await.unwrap().is_empty());
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_bugfix_never_records_design() {
        let harness = Harness::builder().finish();
        let mut request = unattended(ChangeKind::Bugfix);
        request.skip_design = false;
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.status, RunStatus::Complete);
        assert!(run.outcome(Stage::Design).is_none());
        assert!(run.outcome(Stage::DesignApproval).is_none());
        assert!(harness.design.tasks().await.is_empty());

        let dev_tasks = harness.dev.tasks().await;
        assert_eq!(dev_tasks[0].kind, TaskKind::FixBug);
        assert_eq!(dev_tasks[0].context.approved_design, None);
    }

    #[tokio::test]
    async fn test_skip_design_for_feature() {
        let harness = Harness::builder().finish();
        let mut request = unattended(ChangeKind::Feature);
        request.skip_design = true;
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.recorded_stages()[0], Stage::Dev);
        assert_eq!(run.outcomes.len(), 6);
    }

    #[tokio::test]
    async fn test_context_flows_downstream() {
        let harness = Harness::builder().finish();
        harness.orchestrator.run(unattended(ChangeKind::Feature)).await;

        let dev_task = &harness.dev.tasks().await[0];
        assert_eq!(dev_task.kind, TaskKind::ImplementFeature);
        assert!(dev_task.context.approved_design.as_deref().unwrap().contains("login form"));

        let test_task = &harness.test.tasks().await[0];
        assert_eq!(test_task.context.upstream_content.as_deref(), Some("Implemented login"));
        assert_eq!(test_task.context.files, vec!["src/login.rs", "src/session.rs"]);

        let scan_task = &harness.scanner.tasks().await[0];
        assert_eq!(
            scan_task.context.files,
            vec!["src/login.rs", "src/session.rs", "tests/login_test.rs"]
        );
        assert!(scan_task.context.upstream_content.as_deref().unwrap().starts_with("Dev changes:"));
    }

    #[tokio::test]
    async fn test_security_block_is_terminal_regardless_of_approvals() {
        for require_approvals in [true, false] {
            let decisions = vec![Decision::approve("alice"); 3];
            let harness = Harness::builder()
                .security_report(BLOCK_REPORT)
                .decisions(decisions)
                .finish();

            let request = RunRequest {
                require_approvals,
                deploy_to: vec![Environment::Dev, Environment::Prod],
                ..RunRequest::new("Add login page", ChangeKind::Feature)
            };
            let run = harness.orchestrator.run(request).await;

            assert_eq!(run.status, RunStatus::Blocked);
            assert_eq!(run.stage, Stage::Blocked);
            let error = run.error.clone().unwrap();
            assert!(error.to_string().contains("Security gate blocked"));
            match error {
                RunError::SecurityBlock { reasons } => {
                    assert_eq!(reasons, vec!["Critical severity findings detected".to_string()])
                }
                other => panic!("expected security block, got {:?}", other),
            }
            assert_eq!(run.recorded_stages().last(), Some(&Stage::SecurityGate));
            assert!(run.deployments.is_empty());
            assert!(harness.deployer.deploys().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_warn_requires_checkpoint() {
        let harness = Harness::builder()
            .security_report(WARN_REPORT)
            .decisions(vec![
                Decision::approve("alice"),
                Decision::approve("alice"),
                Decision::approve("alice"),
                Decision::approve("sec-lead"),
            ])
            .finish();
        let run = harness.orchestrator.run(RunRequest::new("Add login page", ChangeKind::Feature)).await;

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.approvals.len(), 4);
        let gate = run.outcome(Stage::SecurityGate).unwrap();
        assert_eq!(gate.result.content, "Approved by sec-lead");
        assert_eq!(gate.approval_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_warn_fails_at_security_gate() {
        let harness = Harness::builder()
            .security_report(WARN_REPORT)
            .decisions(vec![
                Decision::approve("alice"),
                Decision::approve("alice"),
                Decision::reject("sec-lead", "accepting this risk needs a ticket"),
            ])
            .finish();
        let mut request = RunRequest::new("Fix null deref", ChangeKind::Bugfix);
        request.deploy_to = vec![Environment::Dev];
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.status, RunStatus::Failed);
        match run.error.unwrap() {
            RunError::PolicyRejection { stage, approver, .. } => {
                assert_eq!(stage, Stage::SecurityGate);
                assert_eq!(approver.as_deref(), Some("sec-lead"));
            }
            other => panic!("expected policy rejection, got {:?}", other),
        }
        assert!(harness.deployer.deploys().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_halts_before_next_stage() {
        let harness = Harness::builder()
            .decisions(vec![Decision::approve("alice"), Decision::reject("bob", "too broad")])
            .finish();
        let run = harness.orchestrator.run(RunRequest::new("Add login page", ChangeKind::Feature)).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage, Stage::Failed);
        assert_eq!(
            run.recorded_stages(),
            vec![Stage::Design, Stage::DesignApproval, Stage::Dev, Stage::DevApproval]
        );
        assert!(!run.outcome(Stage::DevApproval).unwrap().result.success);
        assert!(harness.test.tasks().await.is_empty());
        assert_eq!(
            run.error.unwrap().to_string(),
            "dev_approval rejected by bob: too broad"
        );

        let approvals = harness.gate.list().await.unwrap();
        assert_eq!(approvals.len(), 2);
        let rejected: Vec<_> = approvals
            .iter()
            .filter(|a| a.status == ApprovalStatus::Rejected)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].action, ApprovalAction::CodeChanges);
    }

    #[tokio::test]
    async fn test_collaborator_failure_is_stage_scoped() {
        let harness = Harness::builder()
            .dev(ScriptedWorker::failing("compilation failed"))
            .finish();
        let run = harness.orchestrator.run(unattended(ChangeKind::Refactor)).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.error,
            Some(RunError::CollaboratorFailure {
                stage: Stage::Dev,
                message: "compilation failed".to_string(),
            })
        );
        assert_eq!(run.recorded_stages(), vec![Stage::Dev]);
    }

    #[tokio::test]
    async fn test_raising_collaborator_fails_run() {
        let harness = Harness::builder()
            .dev(ScriptedWorker::raising("connection refused"))
            .finish();
        let run = harness.orchestrator.run(unattended(ChangeKind::Custom)).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_ref().unwrap().kind(), "collaborator_failure");
        assert!(run.error.unwrap().to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_gate_failure_is_not_a_rejection() {
        // No queued decisions: the channel fails on first solicitation
        let harness = Harness::builder().finish();
        let run = harness.orchestrator.run(RunRequest::new("Fix crash", ChangeKind::Bugfix)).await;

        assert_eq!(run.status, RunStatus::Failed);
        match run.error.unwrap() {
            RunError::GateUnavailable { stage, .. } => assert_eq!(stage, Stage::DevApproval),
            other => panic!("expected gate unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_governed_deploy_scenario() {
        let harness = Harness::builder()
            .decisions(vec![
                // design, dev, test checkpoints
                Decision::approve("alice"),
                Decision::approve("alice"),
                Decision::approve("alice"),
                // staging
                Decision::approve("carol"),
                // prod: alice, alice again (refused), then bob
                Decision::approve("alice"),
                Decision::approve("alice"),
                Decision::approve("bob"),
            ])
            .finish();

        let mut request = RunRequest::new("Add login page", ChangeKind::Feature);
        request.deploy_to = vec![Environment::Dev, Environment::Staging, Environment::Prod];
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.status, RunStatus::Complete);
        assert!(is_canonical(&run.recorded_stages()));
        assert_eq!(run.recorded_stages().last(), Some(&Stage::Deployment));

        assert!(run.deployment(Environment::Dev).unwrap().approvers.is_empty());
        assert_eq!(run.deployment(Environment::Staging).unwrap().approvers.len(), 1);
        assert_eq!(
            run.deployment(Environment::Prod).unwrap().approvers,
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert_eq!(harness.channel.remaining().await, 0);

        let deploys = harness.deployer.deploys().await;
        assert_eq!(deploys.len(), 3);
        assert_eq!(deploys[2].version, UNVERSIONED);
    }

    #[tokio::test]
    async fn test_partial_deploy_failure_leaves_run_complete() {
        let harness = Harness::builder().failing(Environment::Staging).finish();
        let mut request = unattended(ChangeKind::Bugfix);
        request.deploy_to = vec![Environment::Dev, Environment::Staging, Environment::Prod];
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.status, RunStatus::Complete);
        assert!(run.error.is_none());
        let results = run.deployment_results();
        assert!(results[&Environment::Dev]);
        assert!(!results[&Environment::Staging]);
        assert!(results[&Environment::Prod]);
    }

    #[tokio::test]
    async fn test_build_and_upload_feed_deployment() {
        let harness = Harness::builder()
            .build(ScriptedBuild::finishing(crate::pipeline::collaborators::BuildStatus::Success, 57))
            .artifact(ScriptedArtifact::new("feedbeef"))
            .finish();

        let mut request = unattended(ChangeKind::Bugfix);
        request.build_job = Some("app-build".to_string());
        request.artifact_path = Some(PathBuf::from("target/app.tar.gz"));
        request.deploy_to = vec![Environment::Staging];
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.build_number, Some(57));
        assert_eq!(
            run.artifact,
            Some(ArtifactRef {
                version: "1.0.57".to_string(),
                sha256: "feedbeef".to_string(),
            })
        );
        assert!(is_canonical(&run.recorded_stages()));
        assert!(run.outcome(Stage::Build).is_some());
        assert!(run.outcome(Stage::ArtifactUpload).is_some());

        let deploys = harness.deployer.deploys().await;
        assert_eq!(deploys[0].version, "1.0.57");
        assert_eq!(deploys[0].hash, "feedbeef");
        assert_eq!(deploys[0].approvers, vec!["auto-approved".to_string()]);
    }

    #[tokio::test]
    async fn test_build_timeout_is_distinct_from_build_failure() {
        let harness = Harness::builder().build(ScriptedBuild::timing_out()).finish();
        let mut request = unattended(ChangeKind::Bugfix);
        request.build_job = Some("app-build".to_string());
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.status, RunStatus::Failed);
        let message = run.error.unwrap().to_string();
        assert!(message.contains("timed out"), "{}", message);

        let harness = Harness::builder()
            .build(ScriptedBuild::finishing(crate::pipeline::collaborators::BuildStatus::Failure, 12))
            .finish();
        let mut request = unattended(ChangeKind::Bugfix);
        request.build_job = Some("app-build".to_string());
        let run = harness.orchestrator.run(request).await;
        let message = run.error.unwrap().to_string();
        assert!(message.contains("FAILURE"));
        assert!(!message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_build_requested_without_collaborator() {
        let harness = Harness::builder().finish();
        let mut request = unattended(ChangeKind::Bugfix);
        request.build_job = Some("app-build".to_string());
        let run = harness.orchestrator.run(request).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.recorded_stages().last(), Some(&Stage::Build));
    }

    #[tokio::test]
    async fn test_audit_covers_every_stage_transition() {
        let harness = Harness::builder().finish();
        let run = harness.orchestrator.run(unattended(ChangeKind::Bugfix)).await;

        let events = harness.audit.events().await;
        let entered = events.iter().filter(|e| e.event == AuditEventKind::StageEntered).count();
        let exited = events
            .iter()
            .filter(|e| matches!(e.event, AuditEventKind::StageCompleted | AuditEventKind::StageFailed))
            .count();
        assert_eq!(entered, run.outcomes.len());
        assert_eq!(exited, run.outcomes.len());
        assert_eq!(events.first().unwrap().event, AuditEventKind::RunStarted);
        assert_eq!(events.last().unwrap().event, AuditEventKind::RunCompleted);
        assert!(events.iter().all(|e| e.run_id == Some(run.id)));

        let dev_events = harness
            .audit
            .read(&AuditFilter {
                run_id: Some(run.id),
                agent: Some("dev".to_string()),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(dev_events.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_holds_terminal_snapshot() {
        let harness = Harness::builder().finish();
        let run = harness.orchestrator.run(unattended(ChangeKind::Bugfix)).await;
        let stored = harness.orchestrator.registry().get(run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Complete);
        assert_eq!(stored.outcomes.len(), run.outcomes.len());
    }
}
