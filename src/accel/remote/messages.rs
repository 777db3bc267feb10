// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Wire messages for cross-process matrix builds.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::errors::{MatrixError, Result};
use crate::plan::Dimensions;

/// Identifier of one remote build.
///
/// Keys also name handoff files, so they are restricted to ASCII letters,
/// digits, `-`, `_` and `.`, and may not start with `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildKey(String);

impl BuildKey {
    pub fn new<S: Into<String>>(key: S) -> Result<BuildKey> {
        let key = key.into();
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if valid {
            Ok(BuildKey(key))
        } else {
            Err(MatrixError::Config(format!("invalid build key {:?}", key)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BuildKey {
    type Error = MatrixError;

    fn try_from(value: String) -> Result<Self> {
        BuildKey::new(value)
    }
}

impl From<BuildKey> for String {
    fn from(value: BuildKey) -> Self {
        value.0
    }
}

impl Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages exchanged between a producing and a consuming process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Allocate a sparse build; the dimensions carry nonzero counts.
    InitSparse { key: BuildKey, dims: Dimensions },
    /// CSR rows of one chunk.
    ///
    /// `row_header` has one entry per row plus the chunk's end position.
    SparseChunk {
        key: BuildKey,
        chunk: usize,
        row_header: Vec<i64>,
        values: Vec<f32>,
        col_indices: Vec<i32>,
    },
    InitDense { key: BuildKey, dims: Dimensions },
    /// Row-major cells of one chunk.
    DenseChunk {
        key: BuildKey,
        chunk: usize,
        values: Vec<f32>,
    },
    MatrixData {
        key: BuildKey,
        response: Vec<f32>,
        weight: Option<Vec<f32>>,
        offset: Option<Vec<f32>>,
        actual_rows: usize,
    },
    /// Abandon a build and release its buffers.
    Cleanup { key: BuildKey },
}

impl WireMessage {
    pub fn key(&self) -> &BuildKey {
        match self {
            WireMessage::InitSparse { key, .. }
            | WireMessage::SparseChunk { key, .. }
            | WireMessage::InitDense { key, .. }
            | WireMessage::DenseChunk { key, .. }
            | WireMessage::MatrixData { key, .. }
            | WireMessage::Cleanup { key } => key,
        }
    }

    /// Short message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::InitSparse { .. } => "InitSparse",
            WireMessage::SparseChunk { .. } => "SparseChunk",
            WireMessage::InitDense { .. } => "InitDense",
            WireMessage::DenseChunk { .. } => "DenseChunk",
            WireMessage::MatrixData { .. } => "MatrixData",
            WireMessage::Cleanup { .. } => "Cleanup",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<WireMessage> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(BuildKey::new("train-01_a.b").is_ok());
        for bad in ["", ".hidden", "a/b", "..", "a\\b", "x y"] {
            assert!(BuildKey::new(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn decode_rejects_bad_key() {
        let msg = WireMessage::Cleanup {
            key: BuildKey::new("ok").unwrap(),
        };
        let mut bytes = msg.encode().unwrap();
        // postcard strings are length-prefixed; overwrite the key text
        let n = bytes.len();
        bytes[n - 2..].copy_from_slice(b"/.");
        assert!(WireMessage::decode(&bytes).is_err());
    }

    #[test]
    fn sparse_chunk_keeps_nan_bits() {
        let msg = WireMessage::SparseChunk {
            key: BuildKey::new("k").unwrap(),
            chunk: 3,
            row_header: vec![4, 6],
            values: vec![f32::NAN, 2.0],
            col_indices: vec![1, 7],
        };
        let back = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        match back {
            WireMessage::SparseChunk { values, chunk, .. } => {
                assert_eq!(chunk, 3);
                assert_eq!(values[0].to_bits(), f32::NAN.to_bits());
            }
            other => panic!("decoded {}", other.name()),
        }
    }
}
