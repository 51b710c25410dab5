//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::approval::{ApprovalGate, ApprovalStore, FileApprovalStore, HttpDecisionChannel};
use crate::audit::{AuditLog, AuditSink, FileAuditSink};
use crate::config::Settings;
use crate::pipeline::{Collaborators, DeploymentGovernor, DeploymentHistory, PipelineOrchestrator, RunRegistry};
use std::sync::Arc;
use tracing::info;

/// Application state shared across all handlers
pub struct AppState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub governor: Arc<DeploymentGovernor>,
    pub gate: ApprovalGate,
    /// Checkpoints parked on an HTTP decision
    pub decisions: Arc<HttpDecisionChannel>,
    pub audit: AuditLog,
    pub registry: Arc<RunRegistry>,
}

impl AppState {
    /// Wire the core services around an approval store, audit log and history
    pub fn new(
        collaborators: Collaborators,
        store: Arc<dyn ApprovalStore>,
        audit: AuditLog,
        history: Arc<DeploymentHistory>,
        settings: &Settings,
    ) -> Self {
        let decisions = Arc::new(HttpDecisionChannel::new());
        let gate = ApprovalGate::new(store, decisions.clone(), audit.clone());
        let registry = Arc::new(RunRegistry::new());

        let governor = Arc::new(
            DeploymentGovernor::new(gate.clone(), collaborators.deploy.clone(), history, audit.clone())
                .with_prod_approvers(settings.governance.prod_approvers.clone()),
        );
        let orchestrator = Arc::new(
            PipelineOrchestrator::new(collaborators, gate.clone(), governor.clone(), audit.clone(), registry.clone())
                .with_build_timeout(settings.governance.build_timeout),
        );

        Self {
            orchestrator,
            governor,
            gate,
            decisions,
            audit,
            registry,
        }
    }

    /// File-backed state rooted at the configured store path
    pub async fn open(settings: &Settings, collaborators: Collaborators) -> anyhow::Result<Self> {
        let root = &settings.store.path;
        let store: Arc<dyn ApprovalStore> = Arc::new(FileApprovalStore::new(root.join("approvals.json")).await?);
        let history = Arc::new(DeploymentHistory::open(root.join("deployments")).await?);

        let audit = if settings.store.audit_enabled {
            let sink: Arc<dyn AuditSink> = Arc::new(FileAuditSink::new(root.join("audit.jsonl")).await?);
            AuditLog::new(sink, settings.store.summary_cap)
        } else {
            info!("File audit log disabled; keeping audit events in memory");
            AuditLog::in_memory(settings.store.summary_cap).0
        };

        info!("Stores opened under {}", root.display());
        Ok(Self::new(collaborators, store, audit, history, settings))
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
