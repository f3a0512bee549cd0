//! Build matrix: the set of target triples a commit is verified on.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::toolchain::validate_target;

/// One point in the build matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MatrixEntry {
    /// Target triple, e.g. `aarch64-unknown-linux-gnu`.
    pub target: String,
}

impl MatrixEntry {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl std::fmt::Display for MatrixEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.target)
    }
}

/// Ordered, de-duplicated, non-empty set of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    entries: Vec<MatrixEntry>,
}

impl Matrix {
    /// Build a matrix from target triples, keeping first-seen order.
    pub fn from_targets<I, S>(targets: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries: Vec<MatrixEntry> = Vec::new();
        for target in targets {
            let target = target.as_ref().trim();
            validate_target(target).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !entries.iter().any(|e| e.target == target) {
                entries.push(MatrixEntry::new(target));
            }
        }

        if entries.is_empty() {
            return Err(ConfigError::Invalid(
                "matrix must contain at least one target".to_string(),
            ));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MatrixEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a constructed matrix.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_removed_order_kept() {
        let matrix = Matrix::from_targets([
            "x86_64-unknown-linux-gnu",
            "aarch64-unknown-linux-gnu",
            "x86_64-unknown-linux-gnu",
        ])
        .unwrap();
        let targets: Vec<&str> = matrix.entries().iter().map(|e| e.target.as_str()).collect();
        assert_eq!(
            targets,
            vec!["x86_64-unknown-linux-gnu", "aarch64-unknown-linux-gnu"]
        );
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let err = Matrix::from_targets(Vec::<String>::new()).unwrap_err();
        assert!(err.to_string().contains("at least one target"));
    }

    #[test]
    fn test_malformed_target_rejected() {
        assert!(Matrix::from_targets(["aarch64"]).is_err());
        assert!(Matrix::from_targets(["aarch64--linux"]).is_err());
    }
}
