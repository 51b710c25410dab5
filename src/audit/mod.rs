//! Audit Trail
//!
//! Append-only, timestamped record of lifecycle and governance events.
//! Nothing reads it back for control decisions; it serves status queries
//! and compliance review.
//!
//! Storage is pluggable through [`AuditSink`]. The file sink writes one JSON
//! record per line to `<store>/audit.jsonl`.

mod event;
mod sink;

pub use event::{redact_details, truncate_summary, AuditEvent, AuditEventKind, AuditFilter, DEFAULT_SUMMARY_CAP};
pub use sink::{AuditError, AuditLog, AuditSink, FileAuditSink, MemoryAuditSink};
