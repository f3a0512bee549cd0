//! Pipeline stage definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunState;

/// The four stages of a Run, in execution order.
///
/// Serialized under the same names [`StageKind::name`] returns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Materialize the repository at the triggering commit
    #[serde(rename = "fetching")]
    Fetch,

    /// Install and activate the toolchain for the target
    #[serde(rename = "provisioning")]
    Provision,

    /// Run the project's build command
    #[serde(rename = "building")]
    Build,

    /// Run the project's test command
    #[serde(rename = "testing")]
    Test,
}

impl StageKind {
    /// All stages in execution order.
    pub const ORDER: [StageKind; 4] = [
        StageKind::Fetch,
        StageKind::Provision,
        StageKind::Build,
        StageKind::Test,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Fetch => "fetching",
            StageKind::Provision => "provisioning",
            StageKind::Build => "building",
            StageKind::Test => "testing",
        }
    }

    /// Run state while this stage is active.
    pub fn run_state(&self) -> RunState {
        match self {
            StageKind::Fetch => RunState::Fetching,
            StageKind::Provision => RunState::Provisioning,
            StageKind::Build => RunState::Building,
            StageKind::Test => RunState::Testing,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal or in-flight status of one stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Running)
    }
}

/// One executed stage of a Run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    /// Which stage this is.
    pub kind: StageKind,

    /// Command line the stage executed (informational for fetch/provision).
    pub command: Vec<String>,

    /// Current status.
    pub status: StageStatus,

    /// Exit code for build/test stages.
    pub exit_code: Option<i32>,

    /// Duration in milliseconds (0 while running).
    pub duration_ms: u64,

    /// When the stage began.
    pub started_at: DateTime<Utc>,
}

impl StageRecord {
    /// Start a new stage record in the `Running` status.
    pub fn start(kind: StageKind, command: Vec<String>) -> Self {
        Self {
            kind,
            command,
            status: StageStatus::Running,
            exit_code: None,
            duration_ms: 0,
            started_at: Utc::now(),
        }
    }

    /// Whether this stage passed.
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}
