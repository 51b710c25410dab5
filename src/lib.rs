//! ChangeGate - Software Change Governance
//!
//! Moves a software change through design, development, testing, security
//! review, build and deployment, with human approval checkpoints between
//! risk-bearing stages and an append-only audit trail of every transition.
//!
//! - [`pipeline::PipelineOrchestrator`] sequences a run through its stages
//! - [`approval::ApprovalGate`] creates, resolves and awaits approvals
//! - [`pipeline::DeploymentGovernor`] applies per-environment approval policy
//! - [`audit::AuditLog`] records lifecycle and governance events

pub mod approval;
pub mod audit;
pub mod config;
pub mod error;
pub mod integrations;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
