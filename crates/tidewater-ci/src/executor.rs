//! Build and Test Executors.
//!
//! Both run a project command template against the Run's toolchain in the
//! fetched workspace. `{target}` and `{channel}` in the template are
//! substituted, and `RUSTUP_TOOLCHAIN` is set so a bare `cargo` resolves to
//! the provisioned channel. Exit code 0 is the only success signal; test
//! output is never parsed.

use std::path::Path;

use crate::error::{CommandFailure, StageError};
use crate::runner::{CommandOutput, CommandRunner, StageCommand};
use crate::stage::StageKind;
use crate::toolchain::ToolchainSpec;

/// Substitute `{target}` and `{channel}` in a command template.
pub fn render_command(template: &[String], toolchain: &ToolchainSpec) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{target}", &toolchain.target)
                .replace("{channel}", &toolchain.channel)
        })
        .collect()
}

/// Runs the project's build and test commands.
#[derive(Debug, Clone)]
pub struct ProjectExecutor {
    timeout_secs: u64,
    tail_lines: usize,
}

impl ProjectExecutor {
    pub fn new(timeout_secs: u64, tail_lines: usize) -> Self {
        Self {
            timeout_secs,
            tail_lines,
        }
    }

    /// Build Executor: fails with [`StageError::Build`] on non-zero exit.
    pub async fn build(
        &self,
        argv: Vec<String>,
        toolchain: &ToolchainSpec,
        workspace: &Path,
    ) -> Result<CommandOutput, StageError> {
        self.run(StageKind::Build, argv, toolchain, workspace)
            .await
            .map_err(StageError::Build)
    }

    /// Test Executor: fails with [`StageError::Test`] on non-zero exit.
    pub async fn test(
        &self,
        argv: Vec<String>,
        toolchain: &ToolchainSpec,
        workspace: &Path,
    ) -> Result<CommandOutput, StageError> {
        self.run(StageKind::Test, argv, toolchain, workspace)
            .await
            .map_err(StageError::Test)
    }

    async fn run(
        &self,
        kind: StageKind,
        argv: Vec<String>,
        toolchain: &ToolchainSpec,
        workspace: &Path,
    ) -> Result<CommandOutput, CommandFailure> {
        let command = StageCommand::new(kind.name(), argv)
            .in_dir(workspace)
            .with_env("RUSTUP_TOOLCHAIN", &toolchain.channel)
            .with_timeout(self.timeout_secs);

        match CommandRunner::execute(&command).await {
            Ok(output) if output.passed() => Ok(output),
            Ok(output) => Err(CommandFailure {
                exit_code: output.exit_code,
                message: format!("{} exited with code {}", kind, output.exit_code),
                output_tail: output.tail(self.tail_lines),
            }),
            Err(e) => Err(CommandFailure {
                exit_code: -1,
                message: e.to_string(),
                output_tail: Vec::new(),
            }),
        }
    }
}
