// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! The native matrix construction contract and an in-memory implementation.

use std::sync::Arc;

use arrow::{
    array::{Array, AsArray, Float32Array, Int32Array, LargeListArray, StructArray},
    buffer::{OffsetBuffer, ScalarBuffer},
    datatypes::{Float32Type, Int32Type},
};
use arrow_schema::{DataType, Field, Fields};
use log::*;
use ndarray::{Array2, ArrayView2};

use crate::errors::{MatrixError, Result};
use crate::segmented::SegmentedArray;

/// Sparse input layouts understood by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseFormat {
    Csr,
}

/// A matrix object owned by the native library.
pub trait DMatrixHandle {
    fn n_rows(&self) -> usize;
    fn n_cols(&self) -> usize;

    fn set_label(&mut self, label: &[f32]) -> Result<()>;
    fn set_weight(&mut self, weight: &[f32]) -> Result<()>;
    fn set_base_margin(&mut self, margin: &[f32]) -> Result<()>;
}

/// Builds native matrices from filled buffers.
///
/// The buffers are borrowed for the duration of the call only; backends
/// must copy whatever they keep.
pub trait DMatrixBackend {
    type Matrix: DMatrixHandle;

    /// Build from a row-major dense buffer, treating `missing` as absent.
    fn build_dense(
        &self,
        data: &SegmentedArray<f32>,
        n_rows: usize,
        n_cols: usize,
        missing: f32,
    ) -> Result<Self::Matrix>;

    /// Build from compressed sparse buffers.
    #[allow(clippy::too_many_arguments)]
    fn build_sparse(
        &self,
        row_ptrs: &SegmentedArray<i64>,
        col_inds: &SegmentedArray<i32>,
        values: &SegmentedArray<f32>,
        format: SparseFormat,
        n_cols: usize,
        n_row_ptrs: usize,
        nnz: usize,
    ) -> Result<Self::Matrix>;
}

/// Backend that keeps matrices in process memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryBackend;

#[derive(Debug, Clone)]
pub enum MatrixData {
    Dense(Array2<f32>),
    /// Rows as lists of `(index, value)` structs.
    Csr(LargeListArray),
}

/// An in-memory native matrix.
#[derive(Debug, Clone)]
pub struct InMemoryDMatrix {
    data: MatrixData,
    n_rows: usize,
    n_cols: usize,
    missing: f32,
    label: Option<Vec<f32>>,
    weight: Option<Vec<f32>>,
    base_margin: Option<Vec<f32>>,
}

impl DMatrixBackend for InMemoryBackend {
    type Matrix = InMemoryDMatrix;

    fn build_dense(
        &self,
        data: &SegmentedArray<f32>,
        n_rows: usize,
        n_cols: usize,
        missing: f32,
    ) -> Result<InMemoryDMatrix> {
        let arr = Array2::from_shape_vec((n_rows, n_cols), data.to_vec())
            .map_err(|e| MatrixError::Native(format!("dense shape: {}", e)))?;
        debug!("built dense matrix {} x {}", n_rows, n_cols);
        Ok(InMemoryDMatrix {
            data: MatrixData::Dense(arr),
            n_rows,
            n_cols,
            missing,
            label: None,
            weight: None,
            base_margin: None,
        })
    }

    fn build_sparse(
        &self,
        row_ptrs: &SegmentedArray<i64>,
        col_inds: &SegmentedArray<i32>,
        values: &SegmentedArray<f32>,
        format: SparseFormat,
        n_cols: usize,
        n_row_ptrs: usize,
        nnz: usize,
    ) -> Result<InMemoryDMatrix> {
        let SparseFormat::Csr = format;
        if row_ptrs.len() != n_row_ptrs || n_row_ptrs == 0 {
            return Err(MatrixError::Native(format!(
                "expected {} row pointers, got {}",
                n_row_ptrs,
                row_ptrs.len()
            )));
        }
        if col_inds.len() != nnz || values.len() != nnz {
            return Err(MatrixError::Native(format!(
                "expected {} entries, got {} indices and {} values",
                nnz,
                col_inds.len(),
                values.len()
            )));
        }

        let ptrs = row_ptrs.to_vec();
        if ptrs[0] != 0 || ptrs.windows(2).any(|w| w[0] > w[1]) {
            return Err(MatrixError::Native("row pointers are not monotone from 0".into()));
        }
        if ptrs[n_row_ptrs - 1] != nnz as i64 {
            return Err(MatrixError::Native(format!(
                "final row pointer {} does not match {} entries",
                ptrs[n_row_ptrs - 1],
                nnz
            )));
        }
        let inds = col_inds.to_vec();
        if let Some(bad) = inds.iter().find(|c| **c < 0 || **c as usize >= n_cols) {
            return Err(MatrixError::Native(format!(
                "column index {} out of bounds for {} columns",
                bad, n_cols
            )));
        }

        let struct_fields = Fields::from(vec![
            Field::new("index", DataType::Int32, false),
            Field::new("value", DataType::Float32, false),
        ]);
        let list_field = Field::new("rows", DataType::Struct(struct_fields.clone()), false);
        let sa = StructArray::try_new(
            struct_fields,
            vec![
                Arc::new(Int32Array::from(inds)),
                Arc::new(Float32Array::from(values.to_vec())),
            ],
            None,
        )?;
        let list = LargeListArray::try_new(
            Arc::new(list_field),
            OffsetBuffer::new(ScalarBuffer::from(ptrs)),
            Arc::new(sa),
            None,
        )?;
        debug!(
            "built CSR matrix {} x {} with {} entries",
            n_row_ptrs - 1,
            n_cols,
            nnz
        );
        Ok(InMemoryDMatrix {
            data: MatrixData::Csr(list),
            n_rows: n_row_ptrs - 1,
            n_cols,
            missing: f32::NAN,
            label: None,
            weight: None,
            base_margin: None,
        })
    }
}

fn check_len(what: &str, n_rows: usize, len: usize) -> Result<()> {
    if len != n_rows {
        Err(MatrixError::Native(format!(
            "{} has {} entries for {} rows",
            what, len, n_rows
        )))
    } else {
        Ok(())
    }
}

impl DMatrixHandle for InMemoryDMatrix {
    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn n_cols(&self) -> usize {
        self.n_cols
    }

    fn set_label(&mut self, label: &[f32]) -> Result<()> {
        check_len("label", self.n_rows, label.len())?;
        self.label = Some(label.to_vec());
        Ok(())
    }

    fn set_weight(&mut self, weight: &[f32]) -> Result<()> {
        check_len("weight", self.n_rows, weight.len())?;
        self.weight = Some(weight.to_vec());
        Ok(())
    }

    fn set_base_margin(&mut self, margin: &[f32]) -> Result<()> {
        check_len("base margin", self.n_rows, margin.len())?;
        self.base_margin = Some(margin.to_vec());
        Ok(())
    }
}

impl InMemoryDMatrix {
    pub fn data(&self) -> &MatrixData {
        &self.data
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.data, MatrixData::Csr(_))
    }

    /// Get the missing-value sentinel used at construction.
    pub fn missing(&self) -> f32 {
        self.missing
    }

    /// Get the dense values, if this is a dense matrix.
    pub fn dense(&self) -> Option<ArrayView2<'_, f32>> {
        match &self.data {
            MatrixData::Dense(a) => Some(a.view()),
            MatrixData::Csr(_) => None,
        }
    }

    /// Get the row pointers of a sparse matrix.
    pub fn row_ptrs(&self) -> Option<&[i64]> {
        match &self.data {
            MatrixData::Csr(l) => Some(l.value_offsets()),
            MatrixData::Dense(_) => None,
        }
    }

    /// Get the number of stored entries (all cells for dense).
    pub fn nnz(&self) -> usize {
        match &self.data {
            MatrixData::Dense(a) => a.len(),
            MatrixData::Csr(l) => l.values().len(),
        }
    }

    /// Get the extent of a sparse row in the entry arrays.
    pub fn row_extent(&self, row: usize) -> Option<(usize, usize)> {
        let ptrs = self.row_ptrs()?;
        if row >= self.n_rows {
            return None;
        }
        Some((ptrs[row] as usize, ptrs[row + 1] as usize))
    }

    /// Get the column indices of a sparse row.
    pub fn row_cols(&self, row: usize) -> Option<Vec<i32>> {
        match &self.data {
            MatrixData::Csr(l) if row < self.n_rows => {
                let row = l.value(row);
                let sa = row.as_struct();
                Some(sa.column(0).as_primitive::<Int32Type>().values().to_vec())
            }
            _ => None,
        }
    }

    /// Get the values of a sparse row.
    pub fn row_vals(&self, row: usize) -> Option<Vec<f32>> {
        match &self.data {
            MatrixData::Csr(l) if row < self.n_rows => {
                let row = l.value(row);
                let sa = row.as_struct();
                Some(sa.column(1).as_primitive::<Float32Type>().values().to_vec())
            }
            _ => None,
        }
    }

    pub fn label(&self) -> Option<&[f32]> {
        self.label.as_deref()
    }

    pub fn weight(&self) -> Option<&[f32]> {
        self.weight.as_deref()
    }

    pub fn base_margin(&self) -> Option<&[f32]> {
        self.base_margin.as_deref()
    }
}
