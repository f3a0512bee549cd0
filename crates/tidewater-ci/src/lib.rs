//! Tidewater CI - build verification for a single repository
//!
//! Provides a pipeline orchestrator that:
//! - Evaluates push / pull-request events against a target branch
//! - Fetches the commit into an isolated workspace (with retry)
//! - Provisions the toolchain for each matrix target, once per spec
//! - Runs the build and test commands, fail-fast
//! - Records every Run and its stage events in a run ledger

pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod gate;
pub mod matrix;
pub mod obs;
pub mod pipeline;
pub mod recording;
pub mod registry;
pub mod run;
pub mod runner;
pub mod stage;
pub mod telemetry;
pub mod toolchain;
pub mod trigger;

// Re-export key types
pub use config::{PipelineConfig, DEFAULT_CONFIG_FILE};
pub use error::{
    CommandFailure, ConfigError, FetchError, ProvisionError, RunError, RunnerError, StageError,
};
pub use executor::ProjectExecutor;
pub use fetch::{fetch_with_retry, GitFetcher, RetryPolicy, Workspace, WorkspaceFetcher};
pub use gate::{CiGate, GateVerdict};
pub use matrix::{Matrix, MatrixEntry};
pub use pipeline::{DispatchResult, Pipeline};
pub use recording::RunRecorder;
pub use registry::{CancelHandle, CancelToken, RunRegistry};
pub use run::{Run, RunFailure, RunOutcome, RunReport, RunState};
pub use runner::{CommandOutput, CommandRunner, StageCommand};
pub use stage::{StageKind, StageRecord, StageStatus};
pub use toolchain::{
    ProvisionOutcome, ProvisionState, Provisioner, RustupProvisioner, ToolchainCache,
    ToolchainProfile, ToolchainSpec,
};
pub use trigger::{EventKind, RepoEvent, TriggerDecision, TriggerEvaluator};
