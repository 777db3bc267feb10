// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Error types for matrix construction.

use arrow::error::ArrowError;
use thiserror::Error;

/// Errors raised while planning, filling, handing off or uploading a matrix.
#[derive(Error, Debug)]
pub enum MatrixError {
    /// Invalid schema, column role or build configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A backing buffer could not be allocated.
    #[error("failed to allocate {requested} bytes: {reason}")]
    Allocation { requested: usize, reason: String },

    /// The planning and fill passes disagree. Always a bug, never bad input.
    #[error("internal consistency fault: {0}")]
    Consistency(String),

    /// Chunk contents that cannot be encoded.
    #[error("invalid data in chunk {chunk}: {message}")]
    Data { chunk: usize, message: String },

    /// Rejected remote upload message; the build has been abandoned.
    #[error("upload protocol error for build {key}: {message}")]
    Protocol { key: String, message: String },

    /// The provider has already handed its buffers to a native matrix.
    #[error("matrix provider has already been materialized")]
    Consumed,

    /// The native matrix library refused the buffers.
    #[error("native matrix construction failed: {0}")]
    Native(String),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MatrixError>;

impl MatrixError {
    pub(crate) fn protocol<K: ToString, M: Into<String>>(key: K, message: M) -> Self {
        MatrixError::Protocol {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn data<M: Into<String>>(chunk: usize, message: M) -> Self {
        MatrixError::Data {
            chunk,
            message: message.into(),
        }
    }
}

/// Convert an [Option] into a [Result] with a formatted error variant.
#[macro_export]
macro_rules! ok_or_err {
    ($opt:expr, $variant:path, $($arg:expr),*) => {
        $opt.ok_or_else(|| $variant(format!($($arg),*)))
    };
}

#[cfg(feature = "python")]
impl From<MatrixError> for pyo3::PyErr {
    fn from(value: MatrixError) -> Self {
        use pyo3::exceptions::{PyMemoryError, PyRuntimeError, PyValueError};
        match value {
            MatrixError::Config(_) | MatrixError::Data { .. } | MatrixError::Json(_) => {
                PyValueError::new_err(format!("{}", value))
            }
            MatrixError::Allocation { .. } => PyMemoryError::new_err(format!("{}", value)),
            _ => PyRuntimeError::new_err(format!("{}", value)),
        }
    }
}
