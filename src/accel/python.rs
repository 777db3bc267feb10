// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Python bindings.

use arrow::{
    array::{AsArray, RecordBatch},
    datatypes::{Float32Type, Int32Type},
    pyarrow::PyArrowType,
};
use log::*;
use numpy::IntoPyArray;
use pyo3::{prelude::*, types::PyDict};

use crate::config::BuildConfig;
use crate::errors::Result;
use crate::frame::ArrowFrame;
use crate::native::{DMatrixHandle, InMemoryBackend, InMemoryDMatrix, MatrixData};
use crate::parallel;
use crate::schema::MatrixLayout;
use crate::MatrixBuilder;

#[pyfunction]
fn init_accel_pool(n_threads: usize) -> PyResult<()> {
    Ok(parallel::init_pool(n_threads)?)
}

#[pyfunction]
fn thread_count() -> PyResult<usize> {
    Ok(parallel::thread_count())
}

fn parse_inputs(columns: &str, config: Option<&str>) -> PyResult<(MatrixLayout, BuildConfig)> {
    let layout = MatrixLayout::from_json(columns)?;
    let config = match config {
        Some(c) => BuildConfig::from_json(c)?,
        None => BuildConfig::default(),
    };
    Ok((layout, config))
}

/// Plan a matrix, returning per-chunk counts and the chosen storage kind.
#[pyfunction]
#[pyo3(signature = (batches, columns, config=None))]
fn plan_matrix<'py>(
    py: Python<'py>,
    batches: Vec<PyArrowType<RecordBatch>>,
    columns: &str,
    config: Option<&str>,
) -> PyResult<Bound<'py, PyDict>> {
    let (layout, config) = parse_inputs(columns, config)?;
    let batches: Vec<RecordBatch> = batches.into_iter().map(|b| b.0).collect();
    let (dims, kind) = py.allow_threads(|| -> Result<_> {
        let frame = ArrowFrame::from_batches(batches)?;
        MatrixBuilder::new(layout, config)?.plan(&frame)
    })?;

    let out = PyDict::new(py);
    out.set_item("kind", kind.to_string())?;
    out.set_item("n_cols", dims.n_cols())?;
    out.set_item("row_counts", dims.row_counts().to_vec())?;
    out.set_item("nonzero_counts", dims.nonzero_counts().map(|c| c.to_vec()))?;
    Ok(out)
}

/// Build a matrix from Arrow record batches, one batch per chunk.
///
/// Returns a dictionary of NumPy arrays: `data` for dense matrices, or
/// `row_ptrs`, `col_inds` and `values` for CSR, plus the side arrays.
#[pyfunction]
#[pyo3(signature = (batches, columns, config=None))]
fn build_matrix<'py>(
    py: Python<'py>,
    batches: Vec<PyArrowType<RecordBatch>>,
    columns: &str,
    config: Option<&str>,
) -> PyResult<Bound<'py, PyDict>> {
    let (layout, config) = parse_inputs(columns, config)?;
    let batches: Vec<RecordBatch> = batches.into_iter().map(|b| b.0).collect();
    debug!("building matrix from {} batches", batches.len());
    let matrix = py.allow_threads(|| -> Result<InMemoryDMatrix> {
        let frame = ArrowFrame::from_batches(batches)?;
        let mut provider = MatrixBuilder::new(layout, config)?.build(&frame)?;
        provider.materialize(&InMemoryBackend)
    })?;

    let out = PyDict::new(py);
    out.set_item("n_rows", matrix.n_rows())?;
    out.set_item("n_cols", matrix.n_cols())?;
    match matrix.data() {
        MatrixData::Dense(arr) => {
            out.set_item("kind", "dense")?;
            out.set_item("data", arr.clone().into_pyarray(py))?;
        }
        MatrixData::Csr(list) => {
            let entries = list.values().as_struct();
            out.set_item("kind", "sparse")?;
            out.set_item("row_ptrs", list.value_offsets().to_vec().into_pyarray(py))?;
            out.set_item(
                "col_inds",
                entries
                    .column(0)
                    .as_primitive::<Int32Type>()
                    .values()
                    .to_vec()
                    .into_pyarray(py),
            )?;
            out.set_item(
                "values",
                entries
                    .column(1)
                    .as_primitive::<Float32Type>()
                    .values()
                    .to_vec()
                    .into_pyarray(py),
            )?;
        }
    }
    if let Some(l) = matrix.label() {
        out.set_item("label", l.to_vec().into_pyarray(py))?;
    }
    if let Some(w) = matrix.weight() {
        out.set_item("weight", w.to_vec().into_pyarray(py))?;
    }
    if let Some(m) = matrix.base_margin() {
        out.set_item("base_margin", m.to_vec().into_pyarray(py))?;
    }
    Ok(out)
}

/// Entry point for the chunkmat extension module.
#[pymodule]
fn chunkmat(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();
    m.add_function(wrap_pyfunction!(init_accel_pool, m)?)?;
    m.add_function(wrap_pyfunction!(thread_count, m)?)?;
    m.add_function(wrap_pyfunction!(plan_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(build_matrix, m)?)?;
    Ok(())
}
