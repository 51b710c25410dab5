//! Scripted collaborators and harnesses shared by the unit tests

use crate::approval::{ApprovalGate, ApprovalStore, Decision, MemoryApprovalStore, QueuedDecisionChannel};
use crate::audit::{AuditLog, MemoryAuditSink};
use crate::pipeline::collaborators::{
    ArtifactCollaborator, ArtifactMetadata, BuildCollaborator, BuildInfo, BuildStatus, CollaboratorError,
    Collaborators, DeployCollaborator, DeployRequest, DeployResult, SecurityCollaborator, WorkCollaborator,
    WorkTask,
};
use crate::pipeline::{DeploymentGovernor, DeploymentHistory, PipelineOrchestrator, RunRegistry};
use crate::pipeline::types::{Environment, WorkOutcome};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const APPROVE_REPORT: &str = "No findings.\n\nDECISION: APPROVE";
pub const WARN_REPORT: &str = "Two medium findings.\n\nDECISION: WARN";
pub const BLOCK_REPORT: &str = "1 CRITICAL finding: hardcoded credentials\n\n**BLOCK**";

enum Script {
    Outcome(WorkOutcome),
    Raise(String),
}

/// Work collaborator returning a fixed outcome and recording every task
pub struct ScriptedWorker {
    script: Script,
    tasks: Mutex<Vec<WorkTask>>,
}

impl ScriptedWorker {
    pub fn succeeding(content: &str, artifacts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Outcome(
                WorkOutcome::ok(content).with_artifacts(artifacts.iter().map(|a| a.to_string()).collect()),
            ),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Outcome(WorkOutcome::failed(error)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn raising(message: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Raise(message.to_string()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn tasks(&self) -> Vec<WorkTask> {
        self.tasks.lock().await.clone()
    }
}

#[async_trait]
impl WorkCollaborator for ScriptedWorker {
    async fn run(&self, task: &WorkTask) -> Result<WorkOutcome, CollaboratorError> {
        self.tasks.lock().await.push(task.clone());
        match &self.script {
            Script::Outcome(outcome) => Ok(outcome.clone()),
            Script::Raise(message) => Err(CollaboratorError::Transport(message.clone())),
        }
    }
}

/// Scanner returning a fixed report
pub struct ScriptedScanner {
    report: String,
    tasks: Mutex<Vec<WorkTask>>,
}

impl ScriptedScanner {
    pub fn new(report: &str) -> Arc<Self> {
        Arc::new(Self {
            report: report.to_string(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn tasks(&self) -> Vec<WorkTask> {
        self.tasks.lock().await.clone()
    }
}

#[async_trait]
impl SecurityCollaborator for ScriptedScanner {
    async fn scan(&self, task: &WorkTask) -> Result<WorkOutcome, CollaboratorError> {
        self.tasks.lock().await.push(task.clone());
        Ok(WorkOutcome::ok(&self.report))
    }
}

/// Build collaborator finishing with a fixed status, or timing out
pub struct ScriptedBuild {
    status: Option<BuildStatus>,
    build_number: u64,
}

impl ScriptedBuild {
    pub fn finishing(status: BuildStatus, build_number: u64) -> Arc<Self> {
        Arc::new(Self {
            status: Some(status),
            build_number,
        })
    }

    pub fn timing_out() -> Arc<Self> {
        Arc::new(Self {
            status: None,
            build_number: 0,
        })
    }
}

#[async_trait]
impl BuildCollaborator for ScriptedBuild {
    async fn trigger_and_wait(
        &self,
        job: &str,
        _parameters: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<BuildInfo, CollaboratorError> {
        let Some(status) = self.status else {
            return Err(CollaboratorError::Timeout {
                operation: format!("build {}", job),
                after: timeout,
            });
        };
        Ok(BuildInfo {
            job_name: job.to_string(),
            build_number: self.build_number,
            status,
            duration_ms: 1200,
            console_url: format!("http://jenkins.local/job/{}/{}/console", job, self.build_number),
            artifacts: Vec::new(),
        })
    }
}

/// Artifact collaborator reporting a fixed checksum
pub struct ScriptedArtifact {
    sha256: String,
}

impl ScriptedArtifact {
    pub fn new(sha256: &str) -> Arc<Self> {
        Arc::new(Self {
            sha256: sha256.to_string(),
        })
    }
}

#[async_trait]
impl ArtifactCollaborator for ScriptedArtifact {
    async fn upload(
        &self,
        path: &Path,
        repository: Option<&str>,
        target_path: &str,
        _properties: &BTreeMap<String, String>,
    ) -> Result<ArtifactMetadata, CollaboratorError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let repository = repository.unwrap_or("libs-release-local").to_string();
        Ok(ArtifactMetadata {
            download_uri: format!("http://artifactory.local/{}/{}/{}", repository, target_path, name),
            repository,
            path: format!("{}/{}", target_path, name),
            size_bytes: 42,
            sha256: self.sha256.clone(),
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        })
    }
}

/// Deploy collaborator recording every call; fails for configured environments
pub struct RecordingDeployer {
    failing: std::sync::Mutex<HashSet<Environment>>,
    deploys: Mutex<Vec<DeployRequest>>,
    rollbacks: Mutex<Vec<(Environment, String)>>,
}

impl RecordingDeployer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failing: std::sync::Mutex::new(HashSet::new()),
            deploys: Mutex::new(Vec::new()),
            rollbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn fail(&self, environment: Environment) {
        self.failing.lock().unwrap().insert(environment);
    }

    fn fails(&self, environment: Environment) -> bool {
        self.failing.lock().unwrap().contains(&environment)
    }

    pub async fn deploys(&self) -> Vec<DeployRequest> {
        self.deploys.lock().await.clone()
    }

    pub async fn rollbacks(&self) -> Vec<(Environment, String)> {
        self.rollbacks.lock().await.clone()
    }
}

#[async_trait]
impl DeployCollaborator for RecordingDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployResult, CollaboratorError> {
        self.deploys.lock().await.push(request.clone());
        if self.fails(request.environment) {
            return Ok(DeployResult::failed(format!("{} cluster unreachable", request.environment)));
        }
        Ok(DeployResult::ok())
    }

    async fn rollback(
        &self,
        environment: Environment,
        target_version: &str,
        _reason: &str,
        _approver: &str,
    ) -> Result<DeployResult, CollaboratorError> {
        self.rollbacks
            .lock()
            .await
            .push((environment, target_version.to_string()));
        Ok(DeployResult::ok())
    }
}

fn gate_with(decisions: Vec<Decision>) -> (ApprovalGate, Arc<QueuedDecisionChannel>, AuditLog, Arc<MemoryAuditSink>) {
    let (audit, sink) = AuditLog::in_memory(200);
    let channel = Arc::new(QueuedDecisionChannel::new(decisions));
    let gate = ApprovalGate::new(Arc::new(MemoryApprovalStore::new()), channel.clone(), audit.clone());
    (gate, channel, audit, sink)
}

/// A governor wired to in-memory stores and a recording deployer
pub struct GovernorHarness {
    pub governor: DeploymentGovernor,
    pub gate: ApprovalGate,
    pub deployer: Arc<RecordingDeployer>,
    pub audit: Arc<MemoryAuditSink>,
}

impl GovernorHarness {
    pub fn new(decisions: Vec<Decision>) -> Self {
        let (gate, _, audit, sink) = gate_with(decisions);
        let deployer = RecordingDeployer::new();
        let governor = DeploymentGovernor::new(
            gate.clone(),
            deployer.clone(),
            Arc::new(DeploymentHistory::in_memory()),
            audit,
        );
        Self {
            governor,
            gate,
            deployer,
            audit: sink,
        }
    }

    pub fn failing(self, environment: Environment) -> Self {
        self.deployer.fail(environment);
        self
    }
}

/// A full orchestrator over scripted collaborators
pub struct Harness {
    pub orchestrator: PipelineOrchestrator,
    pub gate: ApprovalGate,
    pub channel: Arc<QueuedDecisionChannel>,
    pub audit: Arc<MemoryAuditSink>,
    pub design: Arc<ScriptedWorker>,
    pub dev: Arc<ScriptedWorker>,
    pub test: Arc<ScriptedWorker>,
    pub scanner: Arc<ScriptedScanner>,
    pub deployer: Arc<RecordingDeployer>,
}

pub struct HarnessBuilder {
    decisions: Vec<Decision>,
    report: String,
    dev: Arc<ScriptedWorker>,
    build: Option<Arc<dyn BuildCollaborator>>,
    artifact: Option<Arc<dyn ArtifactCollaborator>>,
    failing: Vec<Environment>,
    prod_approvers: Vec<String>,
    build_timeout: Duration,
}

impl HarnessBuilder {
    pub fn decisions(mut self, decisions: Vec<Decision>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn security_report(mut self, report: &str) -> Self {
        self.report = report.to_string();
        self
    }

    pub fn dev(mut self, dev: Arc<ScriptedWorker>) -> Self {
        self.dev = dev;
        self
    }

    pub fn build(mut self, build: Arc<dyn BuildCollaborator>) -> Self {
        self.build = Some(build);
        self
    }

    pub fn artifact(mut self, artifact: Arc<dyn ArtifactCollaborator>) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn failing(mut self, environment: Environment) -> Self {
        self.failing.push(environment);
        self
    }

    pub fn prod_approvers(mut self, approvers: &[&str]) -> Self {
        self.prod_approvers = approvers.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn finish(self) -> Harness {
        let (gate, channel, audit, sink) = gate_with(self.decisions);
        let design = ScriptedWorker::succeeding("## Design\nAdd a login form backed by the session API", &[]);
        let test = ScriptedWorker::succeeding("Generated 4 tests", &["tests/login_test.rs"]);
        let scanner = ScriptedScanner::new(&self.report);
        let deployer = RecordingDeployer::new();
        for environment in self.failing {
            deployer.fail(environment);
        }

        let governor = DeploymentGovernor::new(
            gate.clone(),
            deployer.clone(),
            Arc::new(DeploymentHistory::in_memory()),
            audit.clone(),
        )
        .with_prod_approvers(self.prod_approvers);

        let collaborators = Collaborators {
            design: design.clone(),
            dev: self.dev.clone(),
            test: test.clone(),
            security: scanner.clone(),
            build: self.build,
            artifact: self.artifact,
            deploy: deployer.clone(),
        };

        let orchestrator = PipelineOrchestrator::new(
            collaborators,
            gate.clone(),
            Arc::new(governor),
            audit,
            Arc::new(RunRegistry::new()),
        )
        .with_build_timeout(self.build_timeout);

        Harness {
            orchestrator,
            gate,
            channel,
            audit: sink,
            design,
            dev: self.dev,
            test,
            scanner,
            deployer,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            decisions: Vec::new(),
            report: APPROVE_REPORT.to_string(),
            dev: ScriptedWorker::succeeding("Implemented login", &["src/login.rs", "src/session.rs"]),
            build: None,
            artifact: None,
            failing: Vec::new(),
            prod_approvers: Vec::new(),
            build_timeout: Duration::from_secs(600),
        }
    }
}

/// HTTP-facing state over scripted collaborators and in-memory stores
pub fn scripted_state(security_report: &str) -> (crate::state::AppState, Arc<RecordingDeployer>) {
    scripted_state_over(Arc::new(MemoryApprovalStore::new()), security_report)
}

/// Same as [`scripted_state`], over a caller-supplied approval store
pub fn scripted_state_over(
    store: Arc<dyn ApprovalStore>,
    security_report: &str,
) -> (crate::state::AppState, Arc<RecordingDeployer>) {
    let deployer = RecordingDeployer::new();
    let collaborators = Collaborators {
        design: ScriptedWorker::succeeding("## Design\nAdd a login form", &[]),
        dev: ScriptedWorker::succeeding("Fixed the crash", &["src/session.rs"]),
        test: ScriptedWorker::succeeding("Generated 2 tests", &["tests/session_test.rs"]),
        security: ScriptedScanner::new(security_report),
        build: None,
        artifact: None,
        deploy: deployer.clone(),
    };
    let (audit, _) = AuditLog::in_memory(200);
    let state = crate::state::AppState::new(
        collaborators,
        store,
        audit,
        Arc::new(DeploymentHistory::in_memory()),
        &crate::config::Settings::default(),
    );
    (state, deployer)
}
