// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Build configuration.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::errors::{MatrixError, Result};
use crate::segmented::DEFAULT_SEGMENT_CAPACITY;

/// Requested output storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixKind {
    /// Choose from the fill ratio after planning.
    #[default]
    Auto,
    Dense,
    Sparse,
}

/// Storage actually used for a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Dense,
    Sparse,
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Dense => f.write_str("dense"),
            StorageKind::Sparse => f.write_str("sparse (CSR)"),
        }
    }
}

impl MatrixKind {
    /// Get the forced storage kind, if any.
    pub fn forced(self) -> Option<StorageKind> {
        match self {
            MatrixKind::Auto => None,
            MatrixKind::Dense => Some(StorageKind::Dense),
            MatrixKind::Sparse => Some(StorageKind::Sparse),
        }
    }
}

/// Options controlling a matrix build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub kind: MatrixKind,
    /// Maximum elements per buffer segment.
    pub segment_capacity: usize,
    /// Fill ratio below which `auto` picks sparse storage.
    pub fill_ratio_threshold: f64,
    /// Byte limit for backing buffers, if any.
    pub memory_limit: Option<usize>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            kind: MatrixKind::Auto,
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            fill_ratio_threshold: 0.25,
            memory_limit: None,
        }
    }
}

impl BuildConfig {
    /// Parse and validate a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: BuildConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_kind(mut self, kind: MatrixKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_segment_capacity(mut self, capacity: usize) -> Self {
        self.segment_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_capacity == 0 || self.segment_capacity > DEFAULT_SEGMENT_CAPACITY {
            return Err(MatrixError::Config(format!(
                "segment capacity {} outside 1..={}",
                self.segment_capacity, DEFAULT_SEGMENT_CAPACITY
            )));
        }
        if !(0.0..=1.0).contains(&self.fill_ratio_threshold) {
            return Err(MatrixError::Config(format!(
                "fill ratio threshold {} outside [0, 1]",
                self.fill_ratio_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let cfg = BuildConfig::from_json("{}").unwrap();
        assert_eq!(cfg, BuildConfig::default());
        assert_eq!(cfg.segment_capacity, i32::MAX as usize - 10);
    }

    #[test]
    fn parse_fields() {
        let cfg =
            BuildConfig::from_json(r#"{"kind": "sparse", "segment_capacity": 16, "memory_limit": 4096}"#)
                .unwrap();
        assert_eq!(cfg.kind, MatrixKind::Sparse);
        assert_eq!(cfg.kind.forced(), Some(StorageKind::Sparse));
        assert_eq!(cfg.segment_capacity, 16);
        assert_eq!(cfg.memory_limit, Some(4096));
    }

    #[test]
    fn reject_unknown_and_invalid() {
        assert!(matches!(
            BuildConfig::from_json(r#"{"knid": "dense"}"#),
            Err(MatrixError::Json(_))
        ));
        assert!(matches!(
            BuildConfig::from_json(r#"{"segment_capacity": 0}"#),
            Err(MatrixError::Config(_))
        ));
        assert!(matches!(
            BuildConfig::from_json(r#"{"fill_ratio_threshold": 1.5}"#),
            Err(MatrixError::Config(_))
        ));
    }
}
