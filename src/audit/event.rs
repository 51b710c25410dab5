//! Audit event records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Keys whose values never reach the audit log
const SENSITIVE_KEYS: [&str; 6] = ["password", "secret", "token", "key", "credential", "auth"];

/// Kind of governance or lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    RunStarted,
    StageEntered,
    StageCompleted,
    StageFailed,
    ApprovalRequested,
    ApprovalResolved,
    ApproverRefused,
    RunCompleted,
    RunBlocked,
    RunFailed,
    BuildTriggered,
    ArtifactUploaded,
    Deployment,
    Rollback,
}

/// A single line of the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub event: AuditEventKind,
    /// Stage name, agent name or environment the event concerns
    pub subject: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuditEvent {
    pub fn new(event: AuditEventKind, subject: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id: None,
            event,
            subject: subject.into(),
            summary: summary.into(),
            details: None,
        }
    }

    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Filter for reading the audit log back
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub run_id: Option<Uuid>,
    /// Matches the event subject (agent or stage name)
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(run_id) = self.run_id {
            if event.run_id != Some(run_id) {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if &event.subject != agent {
                return false;
            }
        }
        true
    }

    /// Newest first, capped at `limit`
    pub fn apply(&self, events: impl IntoIterator<Item = AuditEvent>) -> Vec<AuditEvent> {
        let mut selected: Vec<AuditEvent> = events.into_iter().filter(|e| self.matches(e)).collect();
        selected.reverse();
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Summary length kept by default
pub const DEFAULT_SUMMARY_CAP: usize = 200;

/// Cap a summary at `cap` characters, marking the cut with `...`
pub fn truncate_summary(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let mut out: String = text.chars().take(cap).collect();
    out.push_str("...");
    out
}

/// Replace values of sensitive keys with `<redacted>`, recursively
pub fn redact_details(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
                        (k, Value::String("<redacted>".to_string()))
                    } else {
                        (k, redact_details(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_details).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate_summary("short", 10), "short");
    }

    #[test]
    fn test_truncate_long_text() {
        let text = "a".repeat(250);
        let out = truncate_summary(&text, 200);
        assert_eq!(out.len(), 203);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let out = truncate_summary("ééééé", 2);
        assert_eq!(out, "éé...");
    }

    #[test]
    fn test_redact_nested_secrets() {
        let details = json!({
            "jenkins_api_token": "abc",
            "job": "build-app",
            "nested": { "Password": "x", "files": ["a.rs"] }
        });
        let redacted = redact_details(details);
        assert_eq!(redacted["jenkins_api_token"], "<redacted>");
        assert_eq!(redacted["job"], "build-app");
        assert_eq!(redacted["nested"]["Password"], "<redacted>");
        assert_eq!(redacted["nested"]["files"][0], "a.rs");
    }

    #[test]
    fn test_filter_newest_first_with_limit() {
        let run = Uuid::new_v4();
        let events: Vec<AuditEvent> = (0..5)
            .map(|i| AuditEvent::new(AuditEventKind::StageEntered, "dev", format!("e{}", i)).for_run(run))
            .chain(std::iter::once(AuditEvent::new(AuditEventKind::RunStarted, "pipeline", "other")))
            .collect();

        let filter = AuditFilter {
            run_id: Some(run),
            agent: None,
            limit: Some(2),
        };
        let selected = filter.apply(events);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].summary, "e4");
        assert_eq!(selected[1].summary, "e3");
    }
}
