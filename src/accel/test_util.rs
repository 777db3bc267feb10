// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Shared fixtures for unit tests.

use std::sync::Arc;

use arrow::array::{Float64Array, Int32Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::frame::ArrowFrame;
use crate::schema::{ColumnSpec, MatrixLayout};

pub(crate) fn scenario_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("c", DataType::Int32, true),
        Field::new("x", DataType::Float64, true),
        Field::new("w", DataType::Float64, false),
        Field::new("y", DataType::Float64, false),
        Field::new("o", DataType::Float64, false),
    ]))
}

pub(crate) fn scenario_layout() -> MatrixLayout {
    MatrixLayout::new(&[
        ColumnSpec::categorical("c", 3),
        ColumnSpec::numeric("x"),
        ColumnSpec::weight("w"),
        ColumnSpec::response("y"),
        ColumnSpec::offset("o"),
    ])
    .unwrap()
}

pub(crate) fn batch(
    c: Vec<Option<i32>>,
    x: Vec<Option<f64>>,
    w: Vec<f64>,
    y: Vec<f64>,
    o: Vec<f64>,
) -> RecordBatch {
    RecordBatch::try_new(
        scenario_schema(),
        vec![
            Arc::new(Int32Array::from(c)),
            Arc::new(Float64Array::from(x)),
            Arc::new(Float64Array::from(w)),
            Arc::new(Float64Array::from(y)),
            Arc::new(Float64Array::from(o)),
        ],
    )
    .unwrap()
}

/// Two chunks: A has 3 rows with weights [1, 0, 1], B has 2 rows.
///
/// Surviving rows are A0, A2, B0 and B1; their numerics are 1.5, 0.0, NaN
/// and 3.0, so the sparse matrix has 4 + 3 entries.
pub(crate) fn scenario_frame() -> ArrowFrame {
    let a = batch(
        vec![Some(0), Some(1), None],
        vec![Some(1.5), Some(2.0), Some(0.0)],
        vec![1.0, 0.0, 1.0],
        vec![1.0, 0.0, 1.0],
        vec![0.1, 0.2, 0.3],
    );
    let b = batch(
        vec![Some(2), Some(1)],
        vec![None, Some(3.0)],
        vec![1.0, 1.0],
        vec![0.0, 1.0],
        vec![0.4, 0.5],
    );
    ArrowFrame::from_batches(vec![a, b]).unwrap()
}
