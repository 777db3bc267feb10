// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Chunked data frame abstraction.
//!
//! A [Frame] is an ordered, fixed partitioning of rows into chunks. The
//! matrix builder asks each chunk for just the columns it needs, in a fixed
//! local order, and reads values through [ChunkRows].

mod arrow;

pub use self::arrow::{ArrowChunk, ArrowFrame};

use crate::errors::Result;

/// How a column will be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAccess {
    /// Integer level codes of a categorical column.
    Level,
    /// Floating-point values.
    Numeric,
}

/// A column to load from each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRequest {
    /// Position of the column in the frame.
    pub position: usize,
    pub access: ColumnAccess,
}

/// Row access to one loaded chunk.
///
/// Columns are addressed by their index in the request list the chunk was
/// loaded with.
pub trait ChunkRows: Send {
    /// Get the number of rows in the chunk.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a numeric value, with NaN for missing values.
    fn value(&self, col: usize, row: usize) -> f64;

    /// Get a categorical level, or `None` if missing.
    fn level(&self, col: usize, row: usize) -> Option<i64>;
}

/// A dataset partitioned into ordered chunks.
pub trait Frame: Sync {
    type Chunk: ChunkRows;

    fn n_chunks(&self) -> usize;

    /// Look up a column's position by name.
    fn column_position(&self, name: &str) -> Option<usize>;

    /// Load the requested columns of a chunk.
    fn chunk(&self, index: usize, columns: &[ColumnRequest]) -> Result<Self::Chunk>;
}
