// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Backing stores sized exactly from planned dimensions.

use std::sync::Arc;

use log::*;

use crate::config::StorageKind;
use crate::errors::{MatrixError, Result};
use crate::memory::MemoryBudget;
use crate::plan::Dimensions;
use crate::segmented::SegmentedArray;

/// Row-major dense matrix storage.
#[derive(Debug)]
pub struct DenseStore {
    pub data: SegmentedArray<f32>,
    pub n_rows: usize,
    pub n_cols: usize,
}

/// Compressed sparse row storage.
///
/// `row_ptrs` has `n_rows + 1` entries; the last is the entry count.
#[derive(Debug)]
pub struct CsrStore {
    pub row_ptrs: SegmentedArray<i64>,
    pub col_inds: SegmentedArray<i32>,
    pub values: SegmentedArray<f32>,
    pub n_rows: usize,
    pub n_cols: usize,
}

#[derive(Debug)]
pub enum BackingStore {
    Dense(DenseStore),
    Sparse(CsrStore),
}

impl BackingStore {
    /// Allocate zeroed buffers for a matrix with the given dimensions.
    ///
    /// Sparse storage requires nonzero counts. On failure every buffer
    /// allocated so far is released.
    pub fn allocate(
        dims: &Dimensions,
        kind: StorageKind,
        capacity: usize,
        budget: &Arc<MemoryBudget>,
    ) -> Result<BackingStore> {
        let n_rows = dims.total_rows();
        let n_cols = dims.n_cols();
        match kind {
            StorageKind::Dense => {
                let cells = dims.dense_cells().ok_or_else(|| MatrixError::Allocation {
                    requested: usize::MAX,
                    reason: format!("{} x {} dense matrix overflows", n_rows, n_cols),
                })?;
                debug!("allocating dense {} x {} matrix", n_rows, n_cols);
                let data = SegmentedArray::allocate(cells, capacity, budget)?;
                Ok(BackingStore::Dense(DenseStore {
                    data,
                    n_rows,
                    n_cols,
                }))
            }
            StorageKind::Sparse => {
                let nnz = dims.total_nonzeros().ok_or_else(|| {
                    MatrixError::Consistency("sparse storage planned without nonzero counts".into())
                })?;
                debug!(
                    "allocating sparse {} x {} matrix with {} entries",
                    n_rows, n_cols, nnz
                );
                let row_ptrs = SegmentedArray::allocate(n_rows + 1, capacity, budget)?;
                let col_inds = SegmentedArray::allocate(nnz, capacity, budget)?;
                let values = SegmentedArray::allocate(nnz, capacity, budget)?;
                Ok(BackingStore::Sparse(CsrStore {
                    row_ptrs,
                    col_inds,
                    values,
                    n_rows,
                    n_cols,
                }))
            }
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            BackingStore::Dense(_) => StorageKind::Dense,
            BackingStore::Sparse(_) => StorageKind::Sparse,
        }
    }

    pub fn n_rows(&self) -> usize {
        match self {
            BackingStore::Dense(d) => d.n_rows,
            BackingStore::Sparse(s) => s.n_rows,
        }
    }

    pub fn n_cols(&self) -> usize {
        match self {
            BackingStore::Dense(d) => d.n_cols,
            BackingStore::Sparse(s) => s.n_cols,
        }
    }

    /// Get the number of bytes held by the buffers.
    pub fn allocated_bytes(&self) -> usize {
        match self {
            BackingStore::Dense(d) => d.data.allocated_bytes(),
            BackingStore::Sparse(s) => {
                s.row_ptrs.allocated_bytes() + s.col_inds.allocated_bytes() + s.values.allocated_bytes()
            }
        }
    }
}
