//! Workspace Fetcher: materialize the repository at a commit.
//!
//! Every Run gets its own temporary directory. It is removed when the
//! [`Workspace`] is dropped, so an aborted or failed Run never leaves state
//! behind for a later one.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{FetchError, StageError};
use crate::runner::{CommandRunner, StageCommand};

/// An isolated, read-write checkout owned by one Run.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    commit_ref: String,
    resolved_sha: String,
}

impl Workspace {
    pub fn new(dir: TempDir, commit_ref: impl Into<String>, resolved_sha: impl Into<String>) -> Self {
        Self {
            dir,
            commit_ref: commit_ref.into(),
            resolved_sha: resolved_sha.into(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The ref the Run asked for.
    pub fn commit_ref(&self) -> &str {
        &self.commit_ref
    }

    /// The commit the ref resolved to.
    pub fn resolved_sha(&self) -> &str {
        &self.resolved_sha
    }
}

/// Source of workspaces.
#[async_trait]
pub trait WorkspaceFetcher: Send + Sync {
    /// Produce a fresh workspace at `commit_ref`.
    async fn fetch(&self, commit_ref: &str) -> Result<Workspace, FetchError>;

    /// Command line shown in the Run's stage record.
    fn describe(&self, commit_ref: &str) -> Vec<String> {
        vec!["fetch".to_string(), commit_ref.to_string()]
    }
}

/// Fetches a single commit from a git remote into a fresh repository.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    remote: String,
    depth: Option<u32>,
}

impl GitFetcher {
    /// Shallow (depth 1) fetcher for `remote` (URL or local path).
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            depth: Some(1),
        }
    }

    /// Fetch full history instead of a shallow clone.
    pub fn full_history(mut self) -> Self {
        self.depth = None;
        self
    }

    async fn git(dir: &Path, args: &[&str]) -> Result<String, String> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let command = StageCommand::new("git", argv)
            .in_dir(dir)
            .with_env("GIT_TERMINAL_PROMPT", "0");

        match CommandRunner::execute(&command).await {
            Ok(output) if output.passed() => Ok(output.stdout.trim().to_string()),
            Ok(output) => Err(output.stderr.trim().to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl WorkspaceFetcher for GitFetcher {
    async fn fetch(&self, commit_ref: &str) -> Result<Workspace, FetchError> {
        let dir = tempfile::Builder::new().prefix("tidewater-").tempdir()?;
        debug!(path = %dir.path().display(), commit_ref, "Fetching workspace");

        Self::git(dir.path(), &["init", "--quiet"])
            .await
            .map_err(FetchError::Unreachable)?;

        let depth = self.depth.map(|d| format!("--depth={d}"));
        let mut fetch_args = vec!["fetch", "--quiet", "--no-tags"];
        if let Some(depth) = depth.as_deref() {
            fetch_args.push(depth);
        }
        fetch_args.extend([self.remote.as_str(), commit_ref]);
        Self::git(dir.path(), &fetch_args)
            .await
            .map_err(|stderr| classify_fetch_failure(commit_ref, stderr))?;

        Self::git(dir.path(), &["checkout", "--quiet", "--detach", "FETCH_HEAD"])
            .await
            .map_err(|reason| FetchError::Unresolved {
                reference: commit_ref.to_string(),
                reason,
            })?;

        let sha = Self::git(dir.path(), &["rev-parse", "HEAD"])
            .await
            .map_err(|reason| FetchError::Unresolved {
                reference: commit_ref.to_string(),
                reason,
            })?;

        Ok(Workspace::new(dir, commit_ref, sha))
    }

    fn describe(&self, commit_ref: &str) -> Vec<String> {
        vec![
            "git".to_string(),
            "fetch".to_string(),
            self.remote.clone(),
            commit_ref.to_string(),
        ]
    }
}

fn classify_fetch_failure(commit_ref: &str, stderr: String) -> FetchError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("does not appear to be a git repository")
        || lower.contains("could not read from remote")
        || lower.contains("unable to access")
        || lower.contains("could not resolve host")
    {
        FetchError::Unreachable(stderr)
    } else {
        FetchError::Unresolved {
            reference: commit_ref.to_string(),
            reason: stderr,
        }
    }
}

/// Bounded retry with exponential backoff for the fetch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles per attempt.
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Fetch with retries. Returns the workspace and the attempts it took.
pub async fn fetch_with_retry(
    fetcher: &dyn WorkspaceFetcher,
    commit_ref: &str,
    policy: RetryPolicy,
) -> Result<(Workspace, u32), StageError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetcher.fetch(commit_ref).await {
            Ok(workspace) => return Ok((workspace, attempt)),
            Err(source) if attempt >= max_attempts => {
                return Err(StageError::Fetch {
                    attempts: attempt,
                    source,
                })
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                warn!(
                    commit_ref,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Fetch attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
