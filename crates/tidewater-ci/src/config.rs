//! Pipeline configuration.
//!
//! Loaded once at process start and shared read-only (`Arc<PipelineConfig>`)
//! by every Run. Every section and key is optional in the TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fetch::RetryPolicy;
use crate::matrix::{Matrix, MatrixEntry};
use crate::toolchain::{validate_channel, ToolchainProfile, ToolchainSpec};

/// Default file name looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "tidewater.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub trigger: TriggerConfig,
    pub toolchain: ToolchainConfig,
    pub matrix: MatrixConfig,
    pub fetch: FetchConfig,
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerConfig {
    /// Branch that pushes and pull requests must target.
    pub branch: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    pub channel: String,
    pub profile: ToolchainProfile,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            channel: "nightly".to_string(),
            profile: ToolchainProfile::Minimal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MatrixConfig {
    pub targets: Vec<String>,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            targets: vec!["aarch64-unknown-linux-gnu".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Git remote URL or local path.
    pub remote: String,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            remote: ".".to_string(),
            max_attempts: policy.max_attempts,
            backoff_base_ms: policy.backoff_base_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsConfig {
    /// Build argv template; `{target}` and `{channel}` are substituted.
    pub build: Vec<String>,
    /// Test argv template.
    pub test: Vec<String>,
    /// Per-command timeout in seconds (0 = none).
    pub timeout_secs: u64,
    /// Output lines kept in a failure's diagnostics.
    pub output_tail_lines: usize,
}

fn cargo_template(subcommand: &str) -> Vec<String> {
    ["cargo", "+{channel}", subcommand, "--verbose", "--target", "{target}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            build: cargo_template("build"),
            test: cargo_template("test"),
            timeout_secs: 0,
            output_tail_lines: 40,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("trigger.branch is empty".to_string()));
        }
        validate_channel(&self.toolchain.channel)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.matrix()?;
        if self.fetch.remote.trim().is_empty() {
            return Err(ConfigError::Invalid("fetch.remote is empty".to_string()));
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "fetch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.commands.build.is_empty() {
            return Err(ConfigError::Invalid("commands.build is empty".to_string()));
        }
        if self.commands.test.is_empty() {
            return Err(ConfigError::Invalid("commands.test is empty".to_string()));
        }
        Ok(())
    }

    pub fn matrix(&self) -> Result<Matrix, ConfigError> {
        Matrix::from_targets(&self.matrix.targets)
    }

    /// Toolchain a Run for `entry` builds with.
    pub fn toolchain_for(&self, entry: &MatrixEntry) -> ToolchainSpec {
        ToolchainSpec::new(
            self.toolchain.channel.clone(),
            entry.target.clone(),
            self.toolchain.profile,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch.max_attempts,
            backoff_base_ms: self.fetch.backoff_base_ms,
        }
    }
}
