// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Test frames and a reference encoder.
#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{
    DictionaryArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, RecordBatch,
    StringArray,
};
use arrow::datatypes::{DataType, Field, Int16Type, Schema, SchemaRef};

use chunkmat::{ArrowFrame, ColumnRole, ColumnSpec, MatrixLayout};

pub const WIDTH: usize = 13;

/// One input row: categoricals `a` (3 levels) and `b` (5 levels), three
/// numerics, weight, response and offset.
#[derive(Debug, Clone)]
pub struct Row {
    pub a: Option<i32>,
    pub b: Option<i16>,
    pub x: [Option<f64>; 3],
    pub w: f64,
    pub y: f64,
    pub o: f32,
}

pub fn layout() -> MatrixLayout {
    MatrixLayout::new(&[
        ColumnSpec::new("id", ColumnRole::Ignored),
        ColumnSpec::categorical("a", 3),
        ColumnSpec::numeric("x1"),
        ColumnSpec::categorical("b", 5),
        ColumnSpec::numeric("x2"),
        ColumnSpec::numeric("x3"),
        ColumnSpec::weight("w"),
        ColumnSpec::response("y"),
        ColumnSpec::offset("o"),
    ])
    .unwrap()
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Generate rows with missing levels, zero and missing numerics, and
/// zero weights.
pub fn random_rows(seed: u64, n: usize) -> Vec<Row> {
    let mut rng = Lcg(seed);
    (0..n)
        .map(|_| {
            let a = if rng.below(10) == 0 {
                None
            } else {
                Some(rng.below(3) as i32)
            };
            let b = if rng.below(10) == 0 {
                None
            } else {
                Some(rng.below(5) as i16)
            };
            let mut x = [None; 3];
            for v in x.iter_mut() {
                *v = match rng.below(20) {
                    0..=2 => None,
                    3..=9 => Some(0.0),
                    _ => Some(rng.below(1000) as f64 / 100.0 - 5.0),
                };
            }
            let w = if rng.below(5) == 0 {
                0.0
            } else {
                1.0 + rng.below(3) as f64
            };
            Row {
                a,
                b,
                x,
                w,
                y: rng.below(2) as f64,
                o: rng.below(10) as f32 / 10.0,
            }
        })
        .collect()
}

/// Split rows into chunks of the given sizes.
pub fn chunked(rows: &[Row], sizes: &[usize]) -> Vec<Vec<Row>> {
    let mut out = Vec::new();
    let mut pos = 0;
    for s in sizes {
        out.push(rows[pos..pos + s].to_vec());
        pos += s;
    }
    assert_eq!(pos, rows.len(), "chunk sizes do not cover rows");
    out
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("a", DataType::Int32, true),
        Field::new("x1", DataType::Float64, true),
        Field::new(
            "b",
            DataType::Dictionary(Box::new(DataType::Int16), Box::new(DataType::Utf8)),
            true,
        ),
        Field::new("x2", DataType::Float64, true),
        Field::new("x3", DataType::Float64, true),
        Field::new("w", DataType::Float64, false),
        Field::new("y", DataType::Float64, false),
        Field::new("o", DataType::Float32, false),
    ]))
}

pub fn batch(rows: &[Row]) -> RecordBatch {
    let keys = Int16Array::from(rows.iter().map(|r| r.b).collect::<Vec<_>>());
    let levels = StringArray::from(vec!["v", "w", "x", "y", "z"]);
    let b = DictionaryArray::<Int16Type>::try_new(keys, Arc::new(levels)).unwrap();
    let x = |j: usize| Float64Array::from(rows.iter().map(|r| r.x[j]).collect::<Vec<_>>());
    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from_iter_values(0..rows.len() as i64)),
            Arc::new(Int32Array::from(rows.iter().map(|r| r.a).collect::<Vec<_>>())),
            Arc::new(x(0)),
            Arc::new(b),
            Arc::new(x(1)),
            Arc::new(x(2)),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.w))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.y))),
            Arc::new(Float32Array::from_iter_values(rows.iter().map(|r| r.o))),
        ],
    )
    .unwrap()
}

pub fn frame(chunks: &[Vec<Row>]) -> ArrowFrame {
    ArrowFrame::try_new(schema(), chunks.iter().map(|c| batch(c)).collect()).unwrap()
}

/// Encode a surviving row as a dense matrix row.
pub fn expected_row(row: &Row) -> Vec<f32> {
    let mut out = vec![0.0; WIDTH];
    out[row.a.map(|l| l as usize).unwrap_or(3)] = 1.0;
    out[4 + row.b.map(|l| l as usize).unwrap_or(5)] = 1.0;
    for j in 0..3 {
        out[10 + j] = row.x[j].unwrap_or(f64::NAN) as f32;
    }
    out
}

/// Encode all surviving rows.
pub fn expected_rows(rows: &[Row]) -> Vec<Vec<f32>> {
    rows.iter()
        .filter(|r| r.w != 0.0)
        .map(expected_row)
        .collect()
}

/// Compare floats, treating NaNs as equal.
pub fn same(a: f32, b: f32) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}
