//! Error taxonomy for the pipeline.
//!
//! Each stage has its own error type; [`StageError`] wraps them with the
//! stage that produced them so a failed Run can name its failing stage.
//! [`RunError`] is reserved for faults of the orchestrator itself (ledger
//! writes, illegal state transitions, panicked run tasks), never for a
//! build or test that simply failed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidewater_state::StorageError;

use crate::run::RunState;
use crate::stage::StageKind;

/// Errors raised while loading or validating [`crate::PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Workspace Fetcher failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot resolve ref {reference}: {reason}")]
    Unresolved { reference: String, reason: String },

    #[error("repository source unreachable: {0}")]
    Unreachable(String),

    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Toolchain Provisioner failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unsupported toolchain channel: {0}")]
    UnsupportedChannel(String),

    #[error("unsupported target triple: {0}")]
    UnsupportedTarget(String),

    #[error("toolchain install failed for {spec}: {reason}")]
    InstallFailed { spec: String, reason: String },
}

/// Errors from spawning or waiting on a child process.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("stage {stage} has empty command")]
    EmptyCommand { stage: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on {stage}: {source}")]
    Wait {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage {stage} timed out after {timeout_secs} seconds")]
    Timeout { stage: String, timeout_secs: u64 },
}

/// Diagnostic payload shared by build and test failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    /// Process exit code, or -1 when the process never produced one
    /// (spawn failure, timeout, killed by signal).
    pub exit_code: i32,

    /// One-line description.
    pub message: String,

    /// Last lines of stdout followed by stderr.
    pub output_tail: Vec<String>,
}

/// A stage failure. Every variant is fatal to its Run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("fetch failed after {attempts} attempt(s): {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("build failed: {}", .0.message)]
    Build(CommandFailure),

    #[error("tests failed: {}", .0.message)]
    Test(CommandFailure),

    #[error("run aborted during {stage}")]
    Aborted { stage: StageKind },
}

impl StageError {
    /// Build/test diagnostics, if this failure came from a project command.
    pub fn diagnostics(&self) -> Option<&CommandFailure> {
        match self {
            StageError::Build(failure) | StageError::Test(failure) => Some(failure),
            _ => None,
        }
    }

    /// Whether the stage was interrupted rather than failing on its own.
    pub fn is_aborted(&self) -> bool {
        matches!(self, StageError::Aborted { .. })
    }
}

/// Orchestrator faults.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("ledger error: {0}")]
    Ledger(#[from] StorageError),

    #[error("run task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
