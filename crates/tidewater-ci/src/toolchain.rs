//! Toolchain specification and provisioning.
//!
//! Each [`ToolchainSpec`] moves through its own provisioning states:
//!
//! ```text
//! Unprovisioned -> Provisioning -> Active
//!                              \-> Failed   (retried by the next request)
//! ```
//!
//! [`ToolchainCache`] owns that state. Requests for the same spec are
//! serialized on a per-spec lock, so at most one install per spec is in
//! flight and concurrent requesters wait for it instead of duplicating work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::runner::{CommandRunner, StageCommand};

/// Rustup installation profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainProfile {
    #[default]
    Minimal,
    Default,
    Complete,
}

impl ToolchainProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolchainProfile::Minimal => "minimal",
            ToolchainProfile::Default => "default",
            ToolchainProfile::Complete => "complete",
        }
    }
}

/// Toolchain a Run builds with. Immutable once resolved for a Run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ToolchainSpec {
    /// Release channel, e.g. `nightly` or `nightly-2024-05-01`.
    pub channel: String,

    /// Target triple, e.g. `aarch64-unknown-linux-gnu`.
    pub target: String,

    pub profile: ToolchainProfile,
}

impl ToolchainSpec {
    pub fn new(
        channel: impl Into<String>,
        target: impl Into<String>,
        profile: ToolchainProfile,
    ) -> Self {
        Self {
            channel: channel.into(),
            target: target.into(),
            profile,
        }
    }

    /// Check the channel and target are well-formed.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        validate_channel(&self.channel)?;
        validate_target(&self.target)
    }

    /// Stable identity used to key the provisioning cache.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.channel, self.target, self.profile.as_str())
    }
}

impl std::fmt::Display for ToolchainSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {} profile)",
            self.channel,
            self.target,
            self.profile.as_str()
        )
    }
}

/// Accepts `stable`, `beta`, `nightly`, dated channels such as
/// `nightly-2024-05-01`, and numeric releases `1.79` / `1.79.0`.
pub fn validate_channel(channel: &str) -> Result<(), ProvisionError> {
    let unsupported = || ProvisionError::UnsupportedChannel(channel.to_string());

    if matches!(channel, "stable" | "beta" | "nightly") {
        return Ok(());
    }

    if let Some((track, date)) = channel.split_once('-') {
        if matches!(track, "stable" | "beta" | "nightly") {
            return NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map(|_| ())
                .map_err(|_| unsupported());
        }
        return Err(unsupported());
    }

    let parts: Vec<&str> = channel.split('.').collect();
    let numeric = parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if (2..=3).contains(&parts.len()) && numeric {
        Ok(())
    } else {
        Err(unsupported())
    }
}

/// A target triple has two to four non-empty dash-separated components.
pub fn validate_target(target: &str) -> Result<(), ProvisionError> {
    let parts: Vec<&str> = target.split('-').collect();
    let well_formed = (2..=4).contains(&parts.len())
        && parts.iter().all(|p| {
            !p.is_empty()
                && p
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        });
    if well_formed {
        Ok(())
    } else {
        Err(ProvisionError::UnsupportedTarget(target.to_string()))
    }
}

/// Per-spec provisioning state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Unprovisioned,
    Provisioning,
    Active,
    Failed,
}

/// What [`ToolchainCache::ensure`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The toolchain was installed by this call.
    Installed,
    /// Already present on the host; only marked active.
    FoundInstalled,
    /// Already active in this process; no work done.
    AlreadyActive,
}

/// Backend that can check for and install toolchains.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Whether a toolchain matching `spec` is installed.
    async fn is_installed(&self, spec: &ToolchainSpec) -> Result<bool, ProvisionError>;

    /// Install the toolchain and target described by `spec`.
    async fn install(&self, spec: &ToolchainSpec) -> Result<(), ProvisionError>;
}

/// Provisioner that drives `rustup`.
#[derive(Debug, Clone)]
pub struct RustupProvisioner {
    program: String,
    timeout_secs: u64,
}

impl Default for RustupProvisioner {
    fn default() -> Self {
        Self {
            program: "rustup".to_string(),
            timeout_secs: 1800,
        }
    }
}

impl RustupProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different rustup binary (e.g. an absolute path).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn rustup(&self, args: &[&str]) -> Result<(bool, String, String), ProvisionError> {
        let mut argv = vec![self.program.clone()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let command = StageCommand::new("rustup", argv).with_timeout(self.timeout_secs);

        let output = CommandRunner::execute(&command)
            .await
            .map_err(|e| ProvisionError::InstallFailed {
                spec: args.join(" "),
                reason: e.to_string(),
            })?;
        Ok((output.passed(), output.stdout, output.stderr))
    }
}

#[async_trait]
impl Provisioner for RustupProvisioner {
    async fn is_installed(&self, spec: &ToolchainSpec) -> Result<bool, ProvisionError> {
        let (ok, stdout, _) = self.rustup(&["toolchain", "list"]).await?;
        let has_toolchain = ok
            && stdout.lines().any(|line| {
                let name = line.split_whitespace().next().unwrap_or_default();
                lists_channel(name, &spec.channel)
            });
        if !has_toolchain {
            return Ok(false);
        }

        let (ok, stdout, _) = self
            .rustup(&["target", "list", "--installed", "--toolchain", &spec.channel])
            .await?;
        Ok(ok && stdout.lines().any(|line| line.trim() == spec.target))
    }

    async fn install(&self, spec: &ToolchainSpec) -> Result<(), ProvisionError> {
        let (ok, _, stderr) = self
            .rustup(&[
                "toolchain",
                "install",
                &spec.channel,
                "--profile",
                spec.profile.as_str(),
                "--target",
                &spec.target,
                "--no-self-update",
            ])
            .await?;
        if ok {
            return Ok(());
        }
        Err(classify_rustup_failure(spec, &stderr))
    }
}

/// Whether a `rustup toolchain list` name is `channel`, optionally followed
/// by a host triple. `nightly` does not match `nightly-2024-05-01-<host>`.
fn lists_channel(name: &str, channel: &str) -> bool {
    match name.strip_prefix(channel) {
        Some("") => true,
        Some(rest) => rest.strip_prefix('-').is_some_and(|host| {
            let dated = host
                .get(..10)
                .is_some_and(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok());
            !dated
        }),
        None => false,
    }
}

fn classify_rustup_failure(spec: &ToolchainSpec, stderr: &str) -> ProvisionError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("invalid toolchain name")
        || lower.contains("nonexistent rust version")
        || lower.contains("no release found")
    {
        ProvisionError::UnsupportedChannel(spec.channel.clone())
    } else if lower.contains("does not support target")
        || lower.contains("does not contain component 'rust-std'")
        || lower.contains("invalid target")
    {
        ProvisionError::UnsupportedTarget(spec.target.clone())
    } else {
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("rustup exited unsuccessfully")
            .trim()
            .to_string();
        ProvisionError::InstallFailed {
            spec: spec.to_string(),
            reason,
        }
    }
}

type Slot = Arc<Mutex<ProvisionState>>;

/// Single-flight provisioning front for a [`Provisioner`].
pub struct ToolchainCache {
    provisioner: Arc<dyn Provisioner>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ToolchainCache {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, spec: &ToolchainSpec) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(spec.key())
            .or_insert_with(|| Arc::new(Mutex::new(ProvisionState::Unprovisioned)))
            .clone()
    }

    /// Current state for `spec`. Waits if an install for it is in flight.
    pub async fn state(&self, spec: &ToolchainSpec) -> ProvisionState {
        *self.slot(spec).await.lock().await
    }

    /// Make `spec` the active toolchain, installing it if needed.
    ///
    /// Idempotent: a spec that is already `Active` returns immediately
    /// without touching the provisioner.
    pub async fn ensure(&self, spec: &ToolchainSpec) -> Result<ProvisionOutcome, ProvisionError> {
        spec.validate()?;

        let slot = self.slot(spec).await;
        let mut state = slot.lock().await;
        if *state == ProvisionState::Active {
            debug!(toolchain = %spec, "Toolchain already active");
            return Ok(ProvisionOutcome::AlreadyActive);
        }

        *state = ProvisionState::Provisioning;
        let result = match self.provisioner.is_installed(spec).await {
            Ok(true) => Ok(ProvisionOutcome::FoundInstalled),
            Ok(false) => {
                info!(toolchain = %spec, "Installing toolchain");
                self.provisioner
                    .install(spec)
                    .await
                    .map(|_| ProvisionOutcome::Installed)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                *state = ProvisionState::Active;
                Ok(outcome)
            }
            Err(e) => {
                warn!(toolchain = %spec, error = %e, "Toolchain provisioning failed");
                *state = ProvisionState::Failed;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Counts installs; optionally slow or failing.
    #[derive(Default)]
    struct CountingProvisioner {
        installs: AtomicU32,
        fail_first: AtomicU32,
        delay_ms: u64,
    }

    #[async_trait]
    impl Provisioner for CountingProvisioner {
        async fn is_installed(&self, _spec: &ToolchainSpec) -> Result<bool, ProvisionError> {
            Ok(false)
        }

        async fn install(&self, spec: &ToolchainSpec) -> Result<(), ProvisionError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ProvisionError::InstallFailed {
                    spec: spec.to_string(),
                    reason: "disk full".to_string(),
                });
            }
            Ok(())
        }
    }

    fn nightly_arm() -> ToolchainSpec {
        ToolchainSpec::new(
            "nightly",
            "aarch64-unknown-linux-gnu",
            ToolchainProfile::Minimal,
        )
    }

    #[test]
    fn test_channel_validation() {
        for ok in ["stable", "beta", "nightly", "nightly-2024-05-01", "1.79", "1.79.0"] {
            assert!(validate_channel(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "night", "nightly-2024-13-01", "1", "1.x.0", "dev-2024-01-01"] {
            assert!(
                matches!(validate_channel(bad), Err(ProvisionError::UnsupportedChannel(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_target_validation() {
        for ok in [
            "aarch64-unknown-linux-gnu",
            "x86_64-pc-windows-msvc",
            "wasm32-wasi",
            "thumbv7em-none-eabihf",
        ] {
            assert!(validate_target(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "aarch64", "a--b", "a-b-c-d-e", "arm linux-gnu"] {
            assert!(
                matches!(validate_target(bad), Err(ProvisionError::UnsupportedTarget(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_profile_serde_lowercase() {
        let json = serde_json::to_string(&ToolchainProfile::Minimal).unwrap();
        assert_eq!(json, "\"minimal\"");
    }

    #[test]
    fn test_classify_rustup_failure() {
        let spec = nightly_arm();
        assert!(matches!(
            classify_rustup_failure(&spec, "error: invalid toolchain name: 'nightlyy'"),
            ProvisionError::UnsupportedChannel(_)
        ));
        assert!(matches!(
            classify_rustup_failure(&spec, "error: toolchain 'nightly' does not support target 'foo'"),
            ProvisionError::UnsupportedTarget(_)
        ));
        match classify_rustup_failure(&spec, "info: syncing\nerror: No space left on device\n") {
            ProvisionError::InstallFailed { reason, .. } => {
                assert_eq!(reason, "error: No space left on device")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lists_channel() {
        assert!(lists_channel("stable-x86_64-unknown-linux-gnu", "stable"));
        assert!(lists_channel("stable", "stable"));
        assert!(lists_channel(
            "nightly-2024-05-01-x86_64-unknown-linux-gnu",
            "nightly-2024-05-01"
        ));
        assert!(!lists_channel("nightly-2024-05-01-x86_64-unknown-linux-gnu", "nightly"));
        assert!(!lists_channel("1.79.0-x86_64-unknown-linux-gnu", "1.79"));
        assert!(!lists_channel("beta-x86_64-unknown-linux-gnu", "stable"));
    }

    /// A stand-in `rustup` that lists a fixed set of toolchains and targets.
    fn fake_rustup(dir: &std::path::Path) -> RustupProvisioner {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("rustup");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             case \"$1 $2\" in\n\
               'toolchain list')\n\
                 echo 'stable-x86_64-unknown-linux-gnu (default)'\n\
                 echo 'nightly-2024-05-01-x86_64-unknown-linux-gnu' ;;\n\
               'target list')\n\
                 echo 'x86_64-unknown-linux-gnu'\n\
                 echo 'aarch64-unknown-linux-gnu' ;;\n\
               *) exit 1 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        RustupProvisioner::new().with_program(script.to_string_lossy())
    }

    #[tokio::test]
    async fn test_rustup_is_installed_parses_listings() {
        let dir = tempfile::tempdir().unwrap();
        let rustup = fake_rustup(dir.path());
        let spec = |channel: &str, target: &str| {
            ToolchainSpec::new(channel, target, ToolchainProfile::Minimal)
        };

        let installed = spec("stable", "aarch64-unknown-linux-gnu");
        assert!(rustup.is_installed(&installed).await.unwrap());

        let missing_target = spec("stable", "riscv64gc-unknown-linux-gnu");
        assert!(!rustup.is_installed(&missing_target).await.unwrap());

        let dated = spec("nightly-2024-05-01", "aarch64-unknown-linux-gnu");
        assert!(rustup.is_installed(&dated).await.unwrap());

        let undated = spec("nightly", "aarch64-unknown-linux-gnu");
        assert!(!rustup.is_installed(&undated).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let cache = ToolchainCache::new(provisioner.clone());
        let spec = nightly_arm();

        assert_eq!(cache.state(&spec).await, ProvisionState::Unprovisioned);
        assert_eq!(cache.ensure(&spec).await.unwrap(), ProvisionOutcome::Installed);
        assert_eq!(cache.ensure(&spec).await.unwrap(), ProvisionOutcome::AlreadyActive);
        assert_eq!(provisioner.installs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state(&spec).await, ProvisionState::Active);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_installs_once() {
        let provisioner = Arc::new(CountingProvisioner {
            delay_ms: 50,
            ..Default::default()
        });
        let cache = Arc::new(ToolchainCache::new(provisioner.clone()));
        let spec = nightly_arm();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let spec = spec.clone();
                tokio::spawn(async move { cache.ensure(&spec).await })
            })
            .collect();
        let outcomes: Vec<ProvisionOutcome> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(provisioner.installs.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ProvisionOutcome::Installed)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_distinct_specs_install_separately() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let cache = ToolchainCache::new(provisioner.clone());

        cache.ensure(&nightly_arm()).await.unwrap();
        cache
            .ensure(&ToolchainSpec::new(
                "nightly",
                "x86_64-unknown-linux-gnu",
                ToolchainProfile::Minimal,
            ))
            .await
            .unwrap();

        assert_eq!(provisioner.installs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_install_is_retried_by_next_request() {
        let provisioner = Arc::new(CountingProvisioner {
            fail_first: AtomicU32::new(1),
            ..Default::default()
        });
        let cache = ToolchainCache::new(provisioner.clone());
        let spec = nightly_arm();

        assert!(cache.ensure(&spec).await.is_err());
        assert_eq!(cache.state(&spec).await, ProvisionState::Failed);

        assert_eq!(cache.ensure(&spec).await.unwrap(), ProvisionOutcome::Installed);
        assert_eq!(provisioner.installs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_spec_never_reaches_provisioner() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let cache = ToolchainCache::new(provisioner.clone());
        let spec = ToolchainSpec::new("nightly", "not a triple", ToolchainProfile::Minimal);

        let err = cache.ensure(&spec).await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnsupportedTarget(_)));
        assert_eq!(provisioner.installs.load(Ordering::SeqCst), 0);
    }
}
