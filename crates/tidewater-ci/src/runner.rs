//! Child-process execution for stages.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RunnerError;

/// Time a timed-out command gets between SIGTERM and SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A command to run as (part of) a stage.
#[derive(Debug, Clone)]
pub struct StageCommand {
    /// Human-readable name used in errors and logs.
    pub name: String,

    /// Command to execute (first element is executable).
    pub argv: Vec<String>,

    /// Working directory; inherits the orchestrator's when `None`.
    pub workdir: Option<PathBuf>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// Timeout in seconds (0 = no timeout).
    pub timeout_secs: u64,
}

impl StageCommand {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            workdir: None,
            env: Vec::new(),
            timeout_secs: 0,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 if terminated by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Whether the process exited with code 0.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// The last `n` lines of stdout followed by stderr.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines: Vec<&str> = self.stdout.lines().chain(self.stderr.lines()).collect();
        let skip = lines.len().saturating_sub(n);
        lines[skip..].iter().map(|l| l.to_string()).collect()
    }
}

/// Executes stage commands.
pub struct CommandRunner;

impl CommandRunner {
    /// Run a command to completion and capture its output.
    ///
    /// The command is spawned as its own process group, so tools it forks
    /// (`rustc`, test binaries) stop with it. On timeout the group gets
    /// SIGTERM, then SIGKILL after a grace period. Dropping the returned
    /// future (a cancelled Run) kills the group outright.
    pub async fn execute(command: &StageCommand) -> Result<CommandOutput, RunnerError> {
        let start = Instant::now();

        let (exe, args) = command
            .argv
            .split_first()
            .ok_or_else(|| RunnerError::EmptyCommand {
                stage: command.name.clone(),
            })?;

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.workdir {
            cmd.current_dir(dir);
        }

        debug!(stage = %command.name, argv = ?command.argv, "Spawning command");
        let mut child: AsyncGroupChild = cmd.group_spawn().map_err(|source| RunnerError::Spawn {
            program: exe.clone(),
            source,
        })?;
        let mut group = GroupGuard::new(child.id());

        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let wait = async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
            Ok::<_, std::io::Error>((status?, stdout?, stderr?))
        };

        let waited = if command.timeout_secs > 0 {
            let timed = tokio::time::timeout(Duration::from_secs(command.timeout_secs), wait).await;
            match timed {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(
                        stage = %command.name,
                        timeout_secs = command.timeout_secs,
                        "Command timed out, terminating process group"
                    );
                    terminate_process_group(&mut child, GRACE_PERIOD).await;
                    group.disarm();
                    return Err(RunnerError::Timeout {
                        stage: command.name.clone(),
                        timeout_secs: command.timeout_secs,
                    });
                }
            }
        } else {
            wait.await
        };
        let (status, stdout, stderr) = waited.map_err(|source| RunnerError::Wait {
            stage: command.name.clone(),
            source,
        })?;
        group.disarm();

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// SIGKILLs a spawned process group on drop unless disarmed.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

#[cfg(unix)]
impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid, "Killing abandoned process group");
            signal_group(pgid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, ?signal, error = %e, "Failed to signal process group"),
    }
}

/// SIGTERM the group, wait up to `grace` for the leader, then SIGKILL
/// whatever is left and reap.
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::sys::signal::Signal;

    let Some(pgid) = child.id() else {
        return;
    };
    signal_group(pgid, Signal::SIGTERM);
    let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
    signal_group(pgid, Signal::SIGKILL);
    if !exited {
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> StageCommand {
        StageCommand::new(
            name,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[test]
    fn test_tail_takes_last_lines_stdout_then_stderr() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: "a\nb\nc\n".to_string(),
            stderr: "d\ne\n".to_string(),
            duration_ms: 5,
        };
        assert_eq!(output.tail(3), vec!["c", "d", "e"]);
        assert_eq!(output.tail(10).len(), 5);
        assert!(output.tail(0).is_empty());
        assert!(!output.passed());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let command = StageCommand::new(
            "echo_test",
            vec!["echo".to_string(), "hello".to_string()],
        );

        let result = CommandRunner::execute(&command).await.expect("execute failed");
        assert!(result.passed());
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_reports_exit_code() {
        let result = CommandRunner::execute(&sh("exit_101", "echo boom >&2; exit 101"))
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_eq!(result.exit_code, 101);
        assert_eq!(result.tail(5), vec!["boom"]);
    }

    #[tokio::test]
    async fn test_execute_uses_workdir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let command = sh("pwd_env", "pwd; echo \"$TIDEWATER_PROBE\"")
            .in_dir(dir.path())
            .with_env("TIDEWATER_PROBE", "probe-value");

        let result = CommandRunner::execute(&command).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(result.stdout.contains(canonical.file_name().unwrap().to_str().unwrap()));
        assert!(result.stdout.contains("probe-value"));
    }

    #[tokio::test]
    async fn test_execute_empty_command() {
        let command = StageCommand::new("empty", vec![]);
        let err = CommandRunner::execute(&command).await.unwrap_err();
        assert!(matches!(err, RunnerError::EmptyCommand { .. }));
    }

    #[tokio::test]
    async fn test_execute_spawn_failure() {
        let command = StageCommand::new(
            "missing",
            vec!["/nonexistent-binary-that-does-not-exist".to_string()],
        );
        let err = CommandRunner::execute(&command).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    /// A command whose grandchild writes `marker` after two seconds.
    fn nested_writer(marker: &std::path::Path) -> StageCommand {
        sh(
            "nested",
            &format!("sh -c 'sleep 2; touch {}'; true", marker.display()),
        )
    }

    #[tokio::test]
    async fn test_timeout_terminates_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("M");

        let err = CommandRunner::execute(&nested_writer(&marker).with_timeout(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "grandchild outlived the timed-out stage");
    }

    #[tokio::test]
    async fn test_dropped_execution_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("M");
        let command = nested_writer(&marker);

        let waited =
            tokio::time::timeout(Duration::from_millis(500), CommandRunner::execute(&command))
                .await;
        assert!(waited.is_err(), "command should still be running");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "grandchild outlived the cancelled stage");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let command = sh("sleepy", "sleep 5").with_timeout(1);
        let start = Instant::now();
        let err = CommandRunner::execute(&command).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { timeout_secs: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
