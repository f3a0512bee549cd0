//! Trigger evaluation: decide whether a repository event starts Runs.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of repository event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            other => Err(format!(
                "unknown event kind '{other}' (expected push or pull_request)"
            )),
        }
    }
}

/// An incoming repository event.
///
/// For a push, `source_branch` is the branch that was pushed. For a pull
/// request, `source_branch` is the head branch and `destination_branch` the
/// base it would merge into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoEvent {
    pub kind: EventKind,
    pub source_branch: String,
    pub destination_branch: String,
    pub commit_ref: String,
}

impl RepoEvent {
    /// A push of `branch` at `commit_ref`.
    pub fn push(branch: impl Into<String>, commit_ref: impl Into<String>) -> Self {
        let branch = branch.into();
        Self {
            kind: EventKind::Push,
            destination_branch: branch.clone(),
            source_branch: branch,
            commit_ref: commit_ref.into(),
        }
    }

    /// A pull request from `source` into `destination` at `commit_ref`.
    pub fn pull_request(
        source: impl Into<String>,
        destination: impl Into<String>,
        commit_ref: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::PullRequest,
            source_branch: source.into(),
            destination_branch: destination.into(),
            commit_ref: commit_ref.into(),
        }
    }

    /// Key under which a newer event supersedes in-flight Runs of an older one.
    pub fn concurrency_group(&self) -> String {
        match self.kind {
            EventKind::Push => format!("push:{}", self.source_branch),
            EventKind::PullRequest => {
                format!("pr:{}->{}", self.source_branch, self.destination_branch)
            }
        }
    }
}

/// Outcome of evaluating an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TriggerDecision {
    Accepted,
    /// Not an error: the event simply does not start a Run.
    Rejected { reason: String },
}

impl TriggerDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TriggerDecision::Accepted)
    }
}

/// Accepts pushes to, and pull requests into, the configured target branch.
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    target_branch: String,
}

impl TriggerEvaluator {
    pub fn new(target_branch: impl Into<String>) -> Self {
        Self {
            target_branch: target_branch.into(),
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    /// Evaluate an event. Pure: no side effects beyond the returned decision.
    pub fn evaluate(&self, event: &RepoEvent) -> TriggerDecision {
        let branch = match event.kind {
            EventKind::Push => &event.source_branch,
            EventKind::PullRequest => &event.destination_branch,
        };

        if *branch == self.target_branch {
            TriggerDecision::Accepted
        } else {
            TriggerDecision::Rejected {
                reason: format!(
                    "{} targets '{}', not '{}'",
                    event.kind, branch, self.target_branch
                ),
            }
        }
    }
}
