//! Approval Gate
//!
//! Durable store of approval requests plus the single- and dual-approver
//! checkpoint protocols the pipeline blocks on.
//!
//! A human saying "no" is a [`Verdict::Rejected`] value, never an error.
//! [`GateError`] is reserved for the approval subsystem itself breaking
//! (unknown id, storage unreachable, decision channel gone).

mod channel;
mod gate;
mod models;
mod store;

pub use channel::{DecisionChannel, HttpDecisionChannel, QueuedDecisionChannel, Solicitation};
pub use gate::{ApprovalGate, DualVerdict, GateError, Verdict};
pub use models::{Agent, ApprovalAction, ApprovalRequest, ApprovalStatus, Decision};
pub use store::{ApprovalStore, FileApprovalStore, MemoryApprovalStore, SwapOutcome};
