// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Producer side of a remote build.

use log::*;

use super::{BuildKey, MessageSink, WireMessage};
use crate::config::StorageKind;
use crate::errors::{MatrixError, Result};
use crate::fill::{check_outcome, fill_dense_chunk, fill_sparse_chunk, SideArrays, SideCursors};
use crate::frame::Frame;
use crate::parallel::par_map_units;
use crate::plan::Dimensions;
use crate::progress::ProgressHandle;
use crate::schema::BoundLayout;

/// Send a planned build through a sink.
///
/// If anything fails after the init message, a cleanup message is sent so
/// the consumer releases the build's buffers.
pub(crate) fn upload<F: Frame, S: MessageSink + ?Sized>(
    frame: &F,
    bound: &BoundLayout<'_>,
    dims: &Dimensions,
    kind: StorageKind,
    key: &BuildKey,
    sink: &S,
) -> Result<()> {
    let init = match kind {
        StorageKind::Sparse => WireMessage::InitSparse {
            key: key.clone(),
            dims: dims.clone(),
        },
        StorageKind::Dense => WireMessage::InitDense {
            key: key.clone(),
            dims: dims.rows_only(),
        },
    };
    sink.send(init)?;

    let res = send_chunks(frame, bound, dims, kind, key, sink);
    if let Err(e) = &res {
        warn!("upload of build {} failed: {}", key, e);
        if let Err(ce) = sink.send(WireMessage::Cleanup { key: key.clone() }) {
            warn!("cleanup of build {} failed: {}", key, ce);
        }
    }
    res
}

fn send_chunks<F: Frame, S: MessageSink + ?Sized>(
    frame: &F,
    bound: &BoundLayout<'_>,
    dims: &Dimensions,
    kind: StorageKind,
    key: &BuildKey,
    sink: &S,
) -> Result<()> {
    let n = dims.n_chunks();
    let n_cols = dims.n_cols();
    let pb = ProgressHandle::new("uploading", n);
    let sides = par_map_units((0..n).collect(), |_i, c: usize| {
        let chunk = frame.chunk(c, bound.requests())?;
        let rows = dims.row_counts()[c];
        let mut side = SideCursors::growable(bound, rows);
        let msg = match kind {
            StorageKind::Sparse => {
                let range = dims.nonzero_range(c).ok_or_else(|| {
                    MatrixError::Consistency("sparse upload without nonzero counts".into())
                })?;
                let mut header = Vec::with_capacity(rows + 1);
                let mut inds = Vec::with_capacity(range.len());
                let mut vals = Vec::with_capacity(range.len());
                let out = fill_sparse_chunk(
                    bound,
                    &chunk,
                    c,
                    range.start,
                    true,
                    &mut header,
                    &mut inds,
                    &mut vals,
                    &mut side,
                )?;
                check_outcome(dims, c, out.rows, Some(out.nonzero_end))?;
                WireMessage::SparseChunk {
                    key: key.clone(),
                    chunk: c,
                    row_header: header,
                    values: vals,
                    col_indices: inds,
                }
            }
            StorageKind::Dense => {
                let mut vals = Vec::with_capacity(rows * n_cols);
                let filled = fill_dense_chunk(bound, &chunk, c, &mut vals, &mut side)?;
                check_outcome(dims, c, filled, None)?;
                WireMessage::DenseChunk {
                    key: key.clone(),
                    chunk: c,
                    values: vals,
                }
            }
        };
        sink.send(msg)?;
        pb.tick();
        Ok(side)
    })?;
    pb.finish();

    let total = dims.total_rows();
    let mut side = SideArrays {
        response: Vec::with_capacity(total),
        weight: bound.layout().has_weight().then(|| Vec::with_capacity(total)),
        offset: bound.layout().has_offset().then(|| Vec::with_capacity(total)),
    };
    for s in sides {
        side.response.extend(s.response);
        if let (Some(dst), Some(src)) = (&mut side.weight, s.weight) {
            dst.extend(src);
        }
        if let (Some(dst), Some(src)) = (&mut side.offset, s.offset) {
            dst.extend(src);
        }
    }
    debug!("sending matrix data for {} rows of build {}", total, key);
    sink.send(WireMessage::MatrixData {
        key: key.clone(),
        response: side.response,
        weight: side.weight,
        offset: side.offset,
        actual_rows: total,
    })
}
