//! Security decision extraction

use super::types::{SecurityDecision, SecurityVerdict};

const BLOCK_MARKERS: [&str; 2] = ["**BLOCK**", "DECISION: BLOCK"];
const WARN_MARKERS: [&str; 2] = ["**WARN**", "DECISION: WARN"];
const APPROVE_MARKERS: [&str; 2] = ["**APPROVE**", "DECISION: APPROVE"];

pub const UNDECIDED_REASON: &str = "Unable to determine security status - manual review required";
pub const UNSPECIFIED_BLOCK_REASON: &str = "Security scan returned BLOCK decision";

fn contains_any(report: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| report.contains(m))
}

/// Classify a scan report as BLOCK, WARN or APPROVE.
///
/// BLOCK wins over WARN, WARN over APPROVE. A report carrying none of the
/// markers is WARN, never APPROVE.
pub fn parse_decision(report: &str) -> SecurityVerdict {
    let upper = report.to_uppercase();

    if contains_any(&upper, &BLOCK_MARKERS) {
        let mut reasons = Vec::new();
        if upper.contains("CRITICAL") {
            reasons.push("Critical severity findings detected".to_string());
        }
        if upper.contains("HIGH") {
            reasons.push("High severity findings detected".to_string());
        }
        if reasons.is_empty() {
            reasons.push(UNSPECIFIED_BLOCK_REASON.to_string());
        }
        return SecurityVerdict {
            decision: SecurityDecision::Block,
            blocking_reasons: reasons,
        };
    }

    if contains_any(&upper, &WARN_MARKERS) {
        return SecurityVerdict {
            decision: SecurityDecision::Warn,
            blocking_reasons: Vec::new(),
        };
    }

    if contains_any(&upper, &APPROVE_MARKERS) {
        return SecurityVerdict {
            decision: SecurityDecision::Approve,
            blocking_reasons: Vec::new(),
        };
    }

    SecurityVerdict {
        decision: SecurityDecision::Warn,
        blocking_reasons: vec![UNDECIDED_REASON.to_string()],
    }
}
