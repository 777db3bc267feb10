// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Frames backed by Arrow record batches.

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, RecordBatch};
use arrow::compute::{cast, cast_with_options, CastOptions};
use arrow::datatypes::{Float64Type, Int64Type};
use arrow_schema::{DataType, SchemaRef};
use log::*;

use super::{ChunkRows, ColumnAccess, ColumnRequest, Frame};
use crate::errors::{MatrixError, Result};
use crate::ok_or_err;

/// A frame with one record batch per chunk.
#[derive(Debug, Clone)]
pub struct ArrowFrame {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

/// Columns of one batch, converted for row access.
pub struct ArrowChunk {
    len: usize,
    columns: Vec<LoadedColumn>,
}

enum LoadedColumn {
    Levels(Int64Array),
    Values(Float64Array),
}

impl ArrowFrame {
    /// Create a frame from batches that all share `schema`.
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        for (i, b) in batches.iter().enumerate() {
            if b.schema().fields() != schema.fields() {
                return Err(MatrixError::Config(format!(
                    "batch {} schema does not match frame schema",
                    i
                )));
            }
        }
        Ok(ArrowFrame { schema, batches })
    }

    /// Create a frame from a non-empty list of batches.
    pub fn from_batches(batches: Vec<RecordBatch>) -> Result<Self> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| MatrixError::Config("cannot infer schema of empty frame".into()))?;
        Self::try_new(schema, batches)
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn n_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

impl Frame for ArrowFrame {
    type Chunk = ArrowChunk;

    fn n_chunks(&self) -> usize {
        self.batches.len()
    }

    fn column_position(&self, name: &str) -> Option<usize> {
        self.schema.index_of(name).ok()
    }

    fn chunk(&self, index: usize, columns: &[ColumnRequest]) -> Result<ArrowChunk> {
        let batch = ok_or_err!(
            self.batches.get(index),
            MatrixError::Config,
            "chunk {} out of range ({} chunks)",
            index,
            self.batches.len()
        )?;
        let mut loaded = Vec::with_capacity(columns.len());
        for req in columns {
            let field = self.schema.field(req.position);
            let col = batch.column(req.position);
            let lc = match req.access {
                ColumnAccess::Level => {
                    LoadedColumn::Levels(load_levels(col, index, field.name())?)
                }
                ColumnAccess::Numeric => LoadedColumn::Values(load_values(col).map_err(|e| {
                    MatrixError::Config(format!("column {}: {}", field.name(), e))
                })?),
            };
            loaded.push(lc);
        }
        Ok(ArrowChunk {
            len: batch.num_rows(),
            columns: loaded,
        })
    }
}

/// Load level codes as Int64.
///
/// Codes that do not fit are a data error rather than a null, so they are
/// never mistaken for missing levels.
fn load_levels(col: &ArrayRef, chunk: usize, name: &str) -> Result<Int64Array> {
    let codes: &dyn Array = match col.data_type() {
        DataType::Dictionary(_, _) => col.as_any_dictionary().keys(),
        dt if dt.is_integer() => &**col,
        dt => {
            return Err(MatrixError::Config(format!(
                "column {}: type {} cannot hold categorical levels",
                name, dt
            )))
        }
    };
    trace!("loading {} level codes of column {}", codes.data_type(), name);
    let opts = CastOptions {
        safe: false,
        ..Default::default()
    };
    let arr = cast_with_options(codes, &DataType::Int64, &opts).map_err(|e| {
        MatrixError::data(chunk, format!("column {}: invalid level code: {}", name, e))
    })?;
    Ok(arr.as_primitive::<Int64Type>().clone())
}

fn load_values(col: &ArrayRef) -> Result<Float64Array> {
    let dt = col.data_type();
    if !(dt.is_numeric() || *dt == DataType::Boolean) {
        return Err(MatrixError::Config(format!("type {} is not numeric", dt)));
    }
    let arr = cast(col, &DataType::Float64)?;
    Ok(arr.as_primitive::<Float64Type>().clone())
}

impl ChunkRows for ArrowChunk {
    fn len(&self) -> usize {
        self.len
    }

    fn value(&self, col: usize, row: usize) -> f64 {
        match &self.columns[col] {
            LoadedColumn::Values(a) if a.is_valid(row) => a.value(row),
            LoadedColumn::Levels(a) if a.is_valid(row) => a.value(row) as f64,
            _ => f64::NAN,
        }
    }

    fn level(&self, col: usize, row: usize) -> Option<i64> {
        match &self.columns[col] {
            LoadedColumn::Levels(a) if a.is_valid(row) => Some(a.value(row)),
            LoadedColumn::Values(a) if a.is_valid(row) => Some(a.value(row) as i64),
            _ => None,
        }
    }
}
