//! Run model and state machine.
//!
//! ```text
//! Pending -> Fetching -> Provisioning -> Building -> Testing -> Succeeded
//!               |             |              |          |
//!               +-------------+--------------+----------+--> Failed
//! any non-terminal state --------------------------------> Aborted
//! ```

use serde::{Deserialize, Serialize};
use tidewater_state::{ContentDigest, RunId};

use crate::error::{RunError, StageError};
use crate::matrix::MatrixEntry;
use crate::stage::{StageKind, StageRecord, StageStatus};
use crate::toolchain::ToolchainSpec;
use crate::trigger::{EventKind, RepoEvent};

/// Lifecycle state of a Run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Fetching,
    Provisioning,
    Building,
    Testing,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Aborted
        )
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Fetching)
            | (Fetching, Provisioning)
            | (Provisioning, Building)
            | (Building, Testing)
            | (Testing, Succeeded) => true,
            (Fetching | Provisioning | Building | Testing, Failed) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Fetching => "fetching",
            RunState::Provisioning => "provisioning",
            RunState::Building => "building",
            RunState::Testing => "testing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Outcome visible to consumers: binary success/failure plus abort.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Pending,
    Success,
    Failed,
    Aborted,
}

/// Why a Run did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFailure {
    /// Stage that ended the Run.
    pub stage: StageKind,
    pub message: String,
    /// Exit code for build/test failures.
    pub exit_code: Option<i32>,
    /// Tail of combined output for build/test failures.
    pub output_tail: Vec<String>,
}

impl RunFailure {
    fn from_stage_error(stage: StageKind, error: &StageError) -> Self {
        let diagnostics = error.diagnostics();
        Self {
            stage,
            message: error.to_string(),
            exit_code: diagnostics.map(|d| d.exit_code),
            output_tail: diagnostics.map(|d| d.output_tail.clone()).unwrap_or_default(),
        }
    }
}

/// One execution of the pipeline for a (commit, matrix entry) pair.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: RunId,
    pub event_kind: EventKind,
    pub target_branch: String,
    pub commit_ref: String,
    pub entry: MatrixEntry,
    pub toolchain: ToolchainSpec,
    state: RunState,
    stages: Vec<StageRecord>,
    failure: Option<RunFailure>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        event: &RepoEvent,
        target_branch: impl Into<String>,
        entry: MatrixEntry,
        toolchain: ToolchainSpec,
    ) -> Self {
        Self {
            run_id,
            event_kind: event.kind,
            target_branch: target_branch.into(),
            commit_ref: event.commit_ref.clone(),
            entry,
            toolchain,
            state: RunState::Pending,
            stages: Vec::new(),
            failure: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    pub fn outcome(&self) -> RunOutcome {
        match self.state {
            RunState::Succeeded => RunOutcome::Success,
            RunState::Failed => RunOutcome::Failed,
            RunState::Aborted => RunOutcome::Aborted,
            _ => RunOutcome::Pending,
        }
    }

    /// Ledger identity: digest of commit, target and toolchain.
    pub fn spec_digest(&self) -> ContentDigest {
        ContentDigest::from_parts([
            self.commit_ref.as_str(),
            self.entry.target.as_str(),
            self.toolchain.channel.as_str(),
            self.toolchain.profile.as_str(),
        ])
    }

    fn transition(&mut self, next: RunState) -> Result<(), RunError> {
        if !self.state.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Enter `kind`. The previous stage must have succeeded.
    pub fn begin_stage(&mut self, kind: StageKind, command: Vec<String>) -> Result<(), RunError> {
        self.transition(kind.run_state())?;
        self.stages.push(StageRecord::start(kind, command));
        Ok(())
    }

    /// Mark the active stage as succeeded.
    pub fn complete_stage(&mut self, exit_code: Option<i32>, duration_ms: u64) -> Result<(), RunError> {
        let state = self.state;
        let stage = self.active_stage_mut(state)?;
        stage.status = StageStatus::Succeeded;
        stage.exit_code = exit_code;
        stage.duration_ms = duration_ms;
        Ok(())
    }

    /// Mark the active stage as failed (or aborted) and end the Run.
    pub fn fail_stage(&mut self, error: &StageError, duration_ms: u64) -> Result<(), RunError> {
        let state = self.state;
        let stage = self.active_stage_mut(state)?;
        let kind = stage.kind;
        stage.status = if error.is_aborted() {
            StageStatus::Aborted
        } else {
            StageStatus::Failed
        };
        stage.exit_code = error.diagnostics().map(|d| d.exit_code);
        stage.duration_ms = duration_ms;

        self.failure = Some(RunFailure::from_stage_error(kind, error));
        if error.is_aborted() {
            self.transition(RunState::Aborted)
        } else {
            self.transition(RunState::Failed)
        }
    }

    /// Abort a Run that is between stages (no stage active).
    pub fn abort(&mut self, next_stage: StageKind) -> Result<(), RunError> {
        self.failure = Some(RunFailure::from_stage_error(
            next_stage,
            &StageError::Aborted { stage: next_stage },
        ));
        self.transition(RunState::Aborted)
    }

    /// Finish a Run whose test stage succeeded.
    pub fn succeed(&mut self) -> Result<(), RunError> {
        let all_passed = self.stages.len() == StageKind::ORDER.len()
            && self.stages.iter().all(StageRecord::passed);
        if !all_passed {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: RunState::Succeeded,
            });
        }
        self.transition(RunState::Succeeded)
    }

    fn active_stage_mut(&mut self, state: RunState) -> Result<&mut StageRecord, RunError> {
        match self.stages.last_mut() {
            Some(stage) if stage.status == StageStatus::Running => Ok(stage),
            _ => Err(RunError::InvalidTransition {
                from: state,
                to: state,
            }),
        }
    }

    /// Snapshot for reporting.
    pub fn report(&self, duration_ms: u64) -> RunReport {
        RunReport {
            run_id: self.run_id.to_string(),
            event_kind: self.event_kind,
            commit_ref: self.commit_ref.clone(),
            target: self.entry.target.clone(),
            toolchain: self.toolchain.clone(),
            outcome: self.outcome(),
            failed_stage: self.failure.as_ref().map(|f| f.stage),
            failure: self.failure.clone(),
            stages: self.stages.clone(),
            duration_ms,
        }
    }
}

/// Observable per-Run output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub event_kind: EventKind,
    pub commit_ref: String,
    pub target: String,
    pub toolchain: ToolchainSpec,
    pub outcome: RunOutcome,
    pub failed_stage: Option<StageKind>,
    pub failure: Option<RunFailure>,
    pub stages: Vec<StageRecord>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }
}
