//! Gate evaluation over a Run's recorded ledger events.
//!
//! The gate is an independent check of the fail-fast contract: a Run passes
//! only if fetching, provisioning, building and testing each started and
//! succeeded, in that order, with nothing started after a failure.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tidewater_state::RunEvent;

use crate::recording::{STAGE_FAILED, STAGE_STARTED, STAGE_SUCCEEDED};
use crate::stage::StageKind;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// CI gate evaluation rules.
pub struct CiGate;

fn stage_of(event: &RunEvent) -> Option<StageKind> {
    serde_json::from_value(event.payload["stage"].clone()).ok()
}

impl CiGate {
    /// Evaluate a Run's events (ordered by seq).
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut succeeded: Vec<StageKind> = Vec::new();
        let mut active: Option<StageKind> = None;
        let mut failed_stages: HashSet<StageKind> = HashSet::new();

        for event in events {
            let Some(stage) = stage_of(event) else {
                violations.push(format!("event {} has no recognizable stage", event.seq));
                continue;
            };

            match event.kind.as_str() {
                STAGE_STARTED => {
                    if !failed_stages.is_empty() {
                        violations.push(format!("stage '{stage}' started after a failed stage"));
                    }
                    let expected = StageKind::ORDER.get(succeeded.len()).copied();
                    if expected != Some(stage) {
                        violations.push(format!("stage '{stage}' started out of order"));
                    }
                    active = Some(stage);
                }
                STAGE_SUCCEEDED => {
                    if active != Some(stage) {
                        violations.push(format!("stage '{stage}' succeeded without starting"));
                    } else {
                        succeeded.push(stage);
                    }
                    active = None;
                }
                STAGE_FAILED => {
                    let error = event.payload["error"].as_str().unwrap_or("unknown error");
                    violations.push(format!("stage '{stage}' failed: {error}"));
                    failed_stages.insert(stage);
                    active = None;
                }
                other => violations.push(format!("unexpected event kind '{other}'")),
            }
        }

        for stage in StageKind::ORDER {
            if !succeeded.contains(&stage) && !failed_stages.contains(&stage) {
                violations.push(format!("stage '{stage}' never completed"));
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All stages passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(seq: u64, kind: &str, stage: &str) -> RunEvent {
        RunEvent {
            seq,
            kind: kind.to_string(),
            payload: json!({ "stage": stage, "error": "exit code 101" }),
            timestamp: Utc::now(),
        }
    }

    fn all_passing() -> Vec<RunEvent> {
        let mut events = Vec::new();
        for (i, stage) in ["fetching", "provisioning", "building", "testing"].iter().enumerate() {
            let seq = (i as u64) * 2;
            events.push(event(seq + 1, STAGE_STARTED, stage));
            events.push(event(seq + 2, STAGE_SUCCEEDED, stage));
        }
        events
    }

    #[test]
    fn test_all_stages_pass() {
        let verdict = CiGate::evaluate(&all_passing());
        assert!(verdict.passed, "{:?}", verdict.violations);
        assert_eq!(verdict.message, "All stages passed");
    }

    #[test]
    fn test_empty_events_fail() {
        let verdict = CiGate::evaluate(&[]);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 4);
    }

    #[test]
    fn test_build_failure_fails_gate() {
        let events = vec![
            event(1, STAGE_STARTED, "fetching"),
            event(2, STAGE_SUCCEEDED, "fetching"),
            event(3, STAGE_STARTED, "provisioning"),
            event(4, STAGE_SUCCEEDED, "provisioning"),
            event(5, STAGE_STARTED, "building"),
            event(6, STAGE_FAILED, "building"),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("building"));
        assert!(verdict.violations.iter().any(|v| v.contains("testing")));
    }

    #[test]
    fn test_stage_after_failure_flagged() {
        let events = vec![
            event(1, STAGE_STARTED, "fetching"),
            event(2, STAGE_FAILED, "fetching"),
            event(3, STAGE_STARTED, "provisioning"),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.contains("after a failed stage")));
    }

    #[test]
    fn test_out_of_order_flagged() {
        let events = vec![
            event(1, STAGE_STARTED, "building"),
            event(2, STAGE_SUCCEEDED, "building"),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.violations.iter().any(|v| v.contains("out of order")));
    }

    #[test]
    fn test_started_but_never_finished() {
        let mut events = all_passing();
        events.pop();
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations, vec!["stage 'testing' never completed"]);
    }

    #[test]
    fn test_failure_text_naming_a_stage_does_not_hide_it() {
        let events = vec![
            event(1, STAGE_STARTED, "fetching"),
            RunEvent {
                seq: 2,
                kind: STAGE_FAILED.to_string(),
                payload: json!({ "stage": "fetching", "error": "cannot resolve ref testing-x" }),
                timestamp: Utc::now(),
            },
        ];
        let verdict = CiGate::evaluate(&events);
        assert_eq!(
            verdict.violations,
            vec![
                "stage 'fetching' failed: cannot resolve ref testing-x",
                "stage 'provisioning' never completed",
                "stage 'building' never completed",
                "stage 'testing' never completed",
            ]
        );
    }
}
