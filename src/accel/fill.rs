// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Chunk fill workers: the second pass.
//!
//! Each chunk writes its rows through cursors positioned at the chunk's
//! planned offsets. Local builds hand the workers disjoint views of the
//! backing store; remote producers hand them plain vectors and ship the
//! result as a patch.

use log::*;

use crate::errors::{MatrixError, Result};
use crate::frame::{ChunkRows, Frame};
use crate::parallel::par_map_units;
use crate::plan::Dimensions;
use crate::progress::ProgressHandle;
use crate::schema::BoundLayout;
use crate::segmented::{split_slice_mut, Cursor};
use crate::store::{BackingStore, CsrStore, DenseStore};

/// Label, weight and offset arrays in output row order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SideArrays {
    pub response: Vec<f32>,
    pub weight: Option<Vec<f32>>,
    pub offset: Option<Vec<f32>>,
}

impl SideArrays {
    /// Allocate zeroed side arrays for `n_rows` rows.
    pub fn allocate(n_rows: usize, weight: bool, offset: bool) -> SideArrays {
        SideArrays {
            response: vec![0.0; n_rows],
            weight: weight.then(|| vec![0.0; n_rows]),
            offset: offset.then(|| vec![0.0; n_rows]),
        }
    }

    pub fn len(&self) -> usize {
        self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.response.is_empty()
    }

    /// Check that the optional arrays match the response length.
    pub fn check(&self) -> Result<()> {
        let n = self.response.len();
        for (name, arr) in [("weight", &self.weight), ("offset", &self.offset)] {
            if let Some(a) = arr {
                if a.len() != n {
                    return Err(MatrixError::Consistency(format!(
                        "{} array has {} rows, response has {}",
                        name,
                        a.len(),
                        n
                    )));
                }
            }
        }
        Ok(())
    }

    /// Split into per-chunk cursors at the row bounds.
    pub(crate) fn split(&mut self, bounds: &[usize]) -> Result<Vec<SideCursors<SliceCursor<'_, f32>>>> {
        let resp = split_slice_mut(&mut self.response, bounds)?;
        let mut wts = match &mut self.weight {
            Some(w) => Some(split_slice_mut(w, bounds)?.into_iter()),
            None => None,
        };
        let mut offs = match &mut self.offset {
            Some(o) => Some(split_slice_mut(o, bounds)?.into_iter()),
            None => None,
        };
        Ok(resp
            .into_iter()
            .map(|r| SideCursors {
                response: SliceCursor::new(r),
                weight: wts.as_mut().and_then(|it| it.next()).map(SliceCursor::new),
                offset: offs.as_mut().and_then(|it| it.next()).map(SliceCursor::new),
            })
            .collect())
    }
}

/// Cursor over a plain mutable slice.
pub(crate) struct SliceCursor<'a, T> {
    slice: &'a mut [T],
    pos: usize,
}

impl<'a, T> SliceCursor<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        SliceCursor { slice, pos: 0 }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.pos == self.slice.len()
    }
}

impl<T: Copy> Cursor<T> for SliceCursor<'_, T> {
    fn put(&mut self, value: T) {
        self.slice[self.pos] = value;
        self.pos += 1;
    }

    fn put_slice(&mut self, values: &[T]) {
        self.slice[self.pos..self.pos + values.len()].copy_from_slice(values);
        self.pos += values.len();
    }

    fn written(&self) -> usize {
        self.pos
    }
}

/// Writers for the side values of one chunk.
pub(crate) struct SideCursors<R> {
    pub response: R,
    pub weight: Option<R>,
    pub offset: Option<R>,
}

impl<R: Cursor<f32>> SideCursors<R> {
    fn put_row<C: ChunkRows>(&mut self, bound: &BoundLayout<'_>, chunk: &C, row: usize) {
        self.response.put(bound.response(chunk, row));
        if let Some(w) = &mut self.weight {
            w.put(bound.row_weight(chunk, row));
        }
        if let (Some(o), Some(v)) = (&mut self.offset, bound.offset(chunk, row)) {
            o.put(v);
        }
    }
}

impl SideCursors<Vec<f32>> {
    /// Create growable side cursors for a producer-side chunk.
    pub(crate) fn growable(bound: &BoundLayout<'_>, rows: usize) -> Self {
        let layout = bound.layout();
        SideCursors {
            response: Vec::with_capacity(rows),
            weight: layout.has_weight().then(|| Vec::with_capacity(rows)),
            offset: layout.has_offset().then(|| Vec::with_capacity(rows)),
        }
    }
}

/// Result of filling one chunk of a sparse matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkOutcome {
    pub rows: usize,
    /// Entry position after the chunk's last row.
    pub nonzero_end: usize,
}

/// Write the CSR rows of one chunk.
///
/// Each surviving row writes its starting entry position, one `(column, 1)`
/// entry per categorical column and one entry per nonzero numeric. With
/// `write_sentinel`, the end position is written after the last row.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fill_sparse_chunk<C, P, I, V, R>(
    bound: &BoundLayout<'_>,
    chunk: &C,
    chunk_idx: usize,
    nz_start: usize,
    write_sentinel: bool,
    row_ptrs: &mut P,
    col_inds: &mut I,
    values: &mut V,
    side: &mut SideCursors<R>,
) -> Result<ChunkOutcome>
where
    C: ChunkRows,
    P: Cursor<i64>,
    I: Cursor<i32>,
    V: Cursor<f32>,
    R: Cursor<f32>,
{
    let nb = bound.numeric_base();
    let mut nz = nz_start;
    let mut rows = 0;
    for r in 0..chunk.len() {
        if !bound.survives(chunk, r) {
            continue;
        }
        row_ptrs.put(nz as i64);
        for i in 0..bound.n_categorical() {
            let col = bound.categorical_column(chunk, chunk_idx, i, r)?;
            col_inds.put(col as i32);
            values.put(1.0);
            nz += 1;
        }
        for j in 0..bound.n_numeric() {
            let v = bound.numeric_value(chunk, j, r);
            if v != 0.0 {
                col_inds.put((nb + j) as i32);
                values.put(v);
                nz += 1;
            }
        }
        side.put_row(bound, chunk, r);
        rows += 1;
    }
    if write_sentinel {
        row_ptrs.put(nz as i64);
    }
    Ok(ChunkOutcome {
        rows,
        nonzero_end: nz,
    })
}

/// Write the dense rows of one chunk, returning the row count.
///
/// Every row is written in full: the one-hot region is cleared before the
/// level columns are set, and missing numerics are stored as NaN.
pub(crate) fn fill_dense_chunk<C, D, R>(
    bound: &BoundLayout<'_>,
    chunk: &C,
    chunk_idx: usize,
    data: &mut D,
    side: &mut SideCursors<R>,
) -> Result<usize>
where
    C: ChunkRows,
    D: Cursor<f32>,
    R: Cursor<f32>,
{
    let nb = bound.numeric_base();
    let mut row_buf = vec![0.0f32; bound.n_cols()];
    let mut rows = 0;
    for r in 0..chunk.len() {
        if !bound.survives(chunk, r) {
            continue;
        }
        row_buf[..nb].fill(0.0);
        for i in 0..bound.n_categorical() {
            let col = bound.categorical_column(chunk, chunk_idx, i, r)?;
            row_buf[col] = 1.0;
        }
        for j in 0..bound.n_numeric() {
            row_buf[nb + j] = bound.numeric_value(chunk, j, r);
        }
        data.put_slice(&row_buf);
        side.put_row(bound, chunk, r);
        rows += 1;
    }
    Ok(rows)
}

/// Check a chunk's fill results against the plan.
pub(crate) fn check_outcome(dims: &Dimensions, chunk: usize, rows: usize, nz_end: Option<usize>) -> Result<()> {
    let planned = dims.row_counts()[chunk];
    if rows != planned {
        return Err(MatrixError::Consistency(format!(
            "chunk {} filled {} rows, planned {}",
            chunk, rows, planned
        )));
    }
    if let (Some(end), Some(range)) = (nz_end, dims.nonzero_range(chunk)) {
        if end != range.end {
            return Err(MatrixError::Consistency(format!(
                "chunk {} ended at entry {}, planned {}",
                chunk, end, range.end
            )));
        }
    }
    Ok(())
}

/// Fill a local backing store and side arrays from every chunk in parallel.
pub(crate) fn fill_local<F: Frame>(
    frame: &F,
    bound: &BoundLayout<'_>,
    dims: &Dimensions,
    store: &mut BackingStore,
    side: &mut SideArrays,
) -> Result<()> {
    let n = dims.n_chunks();
    let pb = ProgressHandle::new("filling", n);
    let side_views = side.split(dims.row_bounds())?;
    match store {
        BackingStore::Dense(ds) => fill_dense(frame, bound, dims, ds, side_views, &pb)?,
        BackingStore::Sparse(cs) => fill_sparse(frame, bound, dims, cs, side_views, &pb)?,
    }
    pb.finish();
    Ok(())
}

fn fill_dense<F: Frame>(
    frame: &F,
    bound: &BoundLayout<'_>,
    dims: &Dimensions,
    store: &mut DenseStore,
    side_views: Vec<SideCursors<SliceCursor<'_, f32>>>,
    pb: &ProgressHandle,
) -> Result<()> {
    let width = store.n_cols;
    let cell_bounds: Vec<usize> = dims.row_bounds().iter().map(|r| r * width).collect();
    let views = store.data.split_mut(&cell_bounds)?;
    let units: Vec<_> = views.into_iter().zip(side_views).collect();
    par_map_units(units, |c, (mut view, mut side)| {
        let chunk = frame.chunk(c, bound.requests())?;
        let rows = fill_dense_chunk(bound, &chunk, c, &mut view, &mut side)?;
        check_outcome(dims, c, rows, None)?;
        if !view.is_full() || !side.response.is_full() {
            return Err(MatrixError::Consistency(format!(
                "chunk {} left {} of {} cells unwritten",
                c,
                view.len() - view.written(),
                view.len()
            )));
        }
        pb.tick();
        Ok(())
    })?;
    debug!("filled dense matrix of {} rows", store.n_rows);
    Ok(())
}

fn fill_sparse<F: Frame>(
    frame: &F,
    bound: &BoundLayout<'_>,
    dims: &Dimensions,
    store: &mut CsrStore,
    side_views: Vec<SideCursors<SliceCursor<'_, f32>>>,
    pb: &ProgressHandle,
) -> Result<()> {
    let n = dims.n_chunks();
    let nz_bounds = dims.nonzero_bounds().ok_or_else(|| {
        MatrixError::Consistency("sparse fill without nonzero counts".into())
    })?;
    let total_nnz = nz_bounds[n];
    let CsrStore {
        row_ptrs,
        col_inds,
        values,
        n_rows,
        ..
    } = store;

    if n == 0 {
        row_ptrs.set(0, 0);
        return Ok(());
    }

    // the last chunk's view also covers the sentinel pointer
    let mut ptr_bounds = dims.row_bounds().to_vec();
    ptr_bounds[n] += 1;
    let ptr_views = row_ptrs.split_mut(&ptr_bounds)?;
    let ind_views = col_inds.split_mut(nz_bounds)?;
    let val_views = values.split_mut(nz_bounds)?;

    let units: Vec<_> = ptr_views
        .into_iter()
        .zip(ind_views)
        .zip(val_views)
        .zip(side_views)
        .collect();
    par_map_units(units, |c, (((mut ptrs, mut inds), mut vals), mut side)| {
        let chunk = frame.chunk(c, bound.requests())?;
        let last = c + 1 == n;
        let out = fill_sparse_chunk(
            bound,
            &chunk,
            c,
            nz_bounds[c],
            last,
            &mut ptrs,
            &mut inds,
            &mut vals,
            &mut side,
        )?;
        check_outcome(dims, c, out.rows, Some(out.nonzero_end))?;
        if last && out.nonzero_end != total_nnz {
            return Err(MatrixError::Consistency(format!(
                "sentinel row pointer {} does not match {} entries",
                out.nonzero_end, total_nnz
            )));
        }
        if !(ptrs.is_full() && inds.is_full() && vals.is_full() && side.response.is_full()) {
            return Err(MatrixError::Consistency(format!(
                "chunk {} did not fill its planned ranges",
                c
            )));
        }
        pb.tick();
        Ok(())
    })?;
    debug!(
        "filled sparse matrix of {} rows with {} entries",
        n_rows, total_nnz
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageKind;
    use crate::memory::MemoryBudget;
    use crate::plan::plan;
    use crate::test_util::{batch, scenario_frame, scenario_layout};
    use crate::frame::ArrowFrame;

    fn build(kind: StorageKind, cap: usize) -> (BackingStore, SideArrays) {
        let layout = scenario_layout();
        let frame = scenario_frame();
        let bound = layout.bind(&frame).unwrap();
        let dims = plan(&frame, &bound, kind == StorageKind::Sparse).unwrap();
        let budget = MemoryBudget::unbounded();
        let mut store = BackingStore::allocate(&dims, kind, cap, &budget).unwrap();
        let mut side = SideArrays::allocate(dims.total_rows(), true, true);
        fill_local(&frame, &bound, &dims, &mut store, &mut side).unwrap();
        (store, side)
    }

    #[test]
    fn sparse_scenario() {
        let (store, side) = build(StorageKind::Sparse, 3);
        let cs = match store {
            BackingStore::Sparse(cs) => cs,
            _ => panic!("expected sparse"),
        };
        assert_eq!(cs.row_ptrs.to_vec(), vec![0, 2, 3, 5, 7]);
        assert_eq!(cs.col_inds.to_vec(), vec![0, 4, 3, 2, 4, 1, 4]);
        let vals = cs.values.to_vec();
        assert_eq!(&vals[..4], &[1.0, 1.5, 1.0, 1.0]);
        assert!(vals[4].is_nan());
        assert_eq!(&vals[5..], &[1.0, 3.0]);

        assert_eq!(side.response, vec![1.0, 1.0, 0.0, 1.0]);
        assert_eq!(side.weight, Some(vec![1.0, 1.0, 1.0, 1.0]));
        assert_eq!(side.offset, Some(vec![0.1, 0.3, 0.4, 0.5]));
    }

    #[test]
    fn dense_scenario() {
        let (store, side) = build(StorageKind::Dense, 7);
        let ds = match store {
            BackingStore::Dense(ds) => ds,
            _ => panic!("expected dense"),
        };
        let data = ds.data.to_vec();
        assert_eq!(data.len(), 20);
        assert_eq!(&data[0..5], &[1.0, 0.0, 0.0, 0.0, 1.5]);
        assert_eq!(&data[5..10], &[0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(&data[10..14], &[0.0, 0.0, 1.0, 0.0]);
        assert!(data[14].is_nan());
        assert_eq!(&data[15..20], &[0.0, 1.0, 0.0, 0.0, 3.0]);
        assert_eq!(side.len(), 4);
    }

    #[test]
    fn bad_level_is_data_error() {
        let layout = scenario_layout();
        let frame = ArrowFrame::from_batches(vec![batch(
            vec![Some(7)],
            vec![Some(1.0)],
            vec![1.0],
            vec![1.0],
            vec![0.0],
        )])
        .unwrap();
        let bound = layout.bind(&frame).unwrap();
        let dims = plan(&frame, &bound, true).unwrap();
        let budget = MemoryBudget::unbounded();
        let mut store = BackingStore::allocate(&dims, StorageKind::Sparse, 16, &budget).unwrap();
        let mut side = SideArrays::allocate(dims.total_rows(), true, true);
        let err = fill_local(&frame, &bound, &dims, &mut store, &mut side).unwrap_err();
        assert!(matches!(err, MatrixError::Data { chunk: 0, .. }));
    }

    #[test]
    fn growable_cursors() {
        let layout = scenario_layout();
        let frame = scenario_frame();
        let bound = layout.bind(&frame).unwrap();
        let chunk = frame.chunk(1, bound.requests()).unwrap();
        let mut ptrs = Vec::new();
        let mut inds = Vec::new();
        let mut vals = Vec::new();
        let mut side = SideCursors::growable(&bound, 2);
        let out = fill_sparse_chunk(
            &bound, &chunk, 1, 3, true, &mut ptrs, &mut inds, &mut vals, &mut side,
        )
        .unwrap();
        assert_eq!(out, ChunkOutcome { rows: 2, nonzero_end: 7 });
        assert_eq!(ptrs, vec![3, 5, 7]);
        assert_eq!(inds, vec![2, 4, 1, 4]);
        assert_eq!(side.response, vec![0.0, 1.0]);
    }
}
