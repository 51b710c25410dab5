//! Governance Pipeline Module
//!
//! Sequences a software change through a fixed set of stages:
//!
//! 1. **Design**: optional, features only, followed by a design checkpoint
//! 2. **Dev / Test**: each followed by a review checkpoint
//! 3. **Security**: scan plus a gate that blocks, warns or passes
//! 4. **Build / Artifact upload**: optional CI/CD stages
//! 5. **Deployment**: per-environment approval policy via the governor

pub mod collaborators;
pub mod deployment;
pub mod history;
pub mod orchestrator;
pub mod registry;
pub mod security;
pub mod types;

// Re-export main types for convenient access
pub use collaborators::{CollaboratorError, Collaborators};
pub use deployment::{DeployError, DeploymentGovernor};
pub use history::{DeploymentHistory, HistoryError};
pub use orchestrator::{PipelineOrchestrator, RunRequest};
pub use registry::RunRegistry;
pub use types::{
    ChangeKind, DeploymentRecord, Environment, PipelineRun, RunError, RunStatus, SecurityDecision, SecurityVerdict,
    Stage, StageOutcome, WorkOutcome,
};
