// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Dimension planning: the first, read-only pass over the chunks.

use std::ops::Range;

use log::*;
use serde::{Deserialize, Serialize};

use crate::errors::{MatrixError, Result};
use crate::frame::{ChunkRows, Frame};
use crate::parallel::par_map_units;
use crate::progress::ProgressHandle;
use crate::schema::BoundLayout;

/// Per-chunk counts and their prefix sums.
///
/// `row_bounds()[c]` is the first output row of chunk `c`, and the final
/// entry is the total row count; nonzero bounds likewise for sparse output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DimensionCounts", into = "DimensionCounts")]
pub struct Dimensions {
    n_cols: usize,
    row_counts: Vec<usize>,
    row_base: Vec<usize>,
    nonzero_counts: Option<Vec<usize>>,
    nonzero_base: Option<Vec<usize>>,
}

/// Serialized form of [Dimensions]; the prefix sums are recomputed on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionCounts {
    pub n_cols: usize,
    pub row_counts: Vec<usize>,
    pub nonzero_counts: Option<Vec<usize>>,
}

fn prefix_sums(counts: &[usize], what: &str) -> Result<Vec<usize>> {
    let mut base = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0usize;
    base.push(acc);
    for c in counts {
        acc = acc
            .checked_add(*c)
            .ok_or_else(|| MatrixError::Config(format!("{} count overflows", what)))?;
        base.push(acc);
    }
    Ok(base)
}

impl Dimensions {
    pub fn new(
        n_cols: usize,
        row_counts: Vec<usize>,
        nonzero_counts: Option<Vec<usize>>,
    ) -> Result<Self> {
        if let Some(nz) = &nonzero_counts {
            if nz.len() != row_counts.len() {
                return Err(MatrixError::Config(format!(
                    "{} nonzero counts for {} chunks",
                    nz.len(),
                    row_counts.len()
                )));
            }
        }
        let row_base = prefix_sums(&row_counts, "row")?;
        let nonzero_base = match &nonzero_counts {
            Some(nz) => Some(prefix_sums(nz, "nonzero")?),
            None => None,
        };
        Ok(Dimensions {
            n_cols,
            row_counts,
            row_base,
            nonzero_counts,
            nonzero_base,
        })
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn n_chunks(&self) -> usize {
        self.row_counts.len()
    }

    pub fn row_counts(&self) -> &[usize] {
        &self.row_counts
    }

    pub fn nonzero_counts(&self) -> Option<&[usize]> {
        self.nonzero_counts.as_deref()
    }

    pub fn total_rows(&self) -> usize {
        self.row_base[self.row_counts.len()]
    }

    /// Get the total sparse entry count, if nonzeros were counted.
    pub fn total_nonzeros(&self) -> Option<usize> {
        self.nonzero_base.as_ref().map(|b| b[b.len() - 1])
    }

    pub fn has_nonzeros(&self) -> bool {
        self.nonzero_counts.is_some()
    }

    /// Get the output row range of a chunk.
    pub fn row_range(&self, chunk: usize) -> Range<usize> {
        self.row_base[chunk]..self.row_base[chunk + 1]
    }

    /// Get the sparse entry range of a chunk.
    pub fn nonzero_range(&self, chunk: usize) -> Option<Range<usize>> {
        self.nonzero_base
            .as_ref()
            .map(|b| b[chunk]..b[chunk + 1])
    }

    /// Get the row prefix sums (one more entry than chunks).
    pub fn row_bounds(&self) -> &[usize] {
        &self.row_base
    }

    pub fn nonzero_bounds(&self) -> Option<&[usize]> {
        self.nonzero_base.as_deref()
    }

    /// Get the number of dense cells, if it fits in memory indices.
    pub fn dense_cells(&self) -> Option<usize> {
        self.total_rows().checked_mul(self.n_cols)
    }

    /// Get the fraction of dense cells that are sparse entries.
    pub fn fill_ratio(&self) -> Option<f64> {
        let nnz = self.total_nonzeros()?;
        let cells = self.total_rows() as f64 * self.n_cols as f64;
        if cells > 0.0 {
            Some(nnz as f64 / cells)
        } else {
            None
        }
    }

    /// Get the counts without nonzero information.
    pub fn rows_only(&self) -> Dimensions {
        Dimensions {
            n_cols: self.n_cols,
            row_counts: self.row_counts.clone(),
            row_base: self.row_base.clone(),
            nonzero_counts: None,
            nonzero_base: None,
        }
    }
}

impl TryFrom<DimensionCounts> for Dimensions {
    type Error = MatrixError;

    fn try_from(value: DimensionCounts) -> Result<Self> {
        Dimensions::new(value.n_cols, value.row_counts, value.nonzero_counts)
    }
}

impl From<Dimensions> for DimensionCounts {
    fn from(value: Dimensions) -> Self {
        DimensionCounts {
            n_cols: value.n_cols,
            row_counts: value.row_counts,
            nonzero_counts: value.nonzero_counts,
        }
    }
}

/// Count surviving rows (and optionally sparse entries) of every chunk.
///
/// Chunks are scanned in parallel; the prefix sums are computed only after
/// every chunk has been counted.
pub fn plan<F: Frame>(frame: &F, bound: &BoundLayout<'_>, count_nonzeros: bool) -> Result<Dimensions> {
    let n = frame.n_chunks();
    debug!(
        "planning {} chunks ({})",
        n,
        if count_nonzeros {
            "rows and nonzeros"
        } else {
            "rows"
        }
    );
    let pb = ProgressHandle::new("planning", n);
    let counts = par_map_units((0..n).collect(), |_i, c: usize| {
        let chunk = frame.chunk(c, bound.requests())?;
        let mut rows = 0;
        let mut nnz = 0;
        for r in 0..chunk.len() {
            if bound.survives(&chunk, r) {
                rows += 1;
                if count_nonzeros {
                    nnz += bound.row_nonzeros(&chunk, r);
                }
            }
        }
        pb.tick();
        Ok((rows, nnz))
    })?;
    pb.finish();

    let (rows, nnz): (Vec<usize>, Vec<usize>) = counts.into_iter().unzip();
    let dims = Dimensions::new(bound.n_cols(), rows, count_nonzeros.then_some(nnz))?;
    debug!(
        "planned {} rows x {} columns, {:?} nonzeros",
        dims.total_rows(),
        dims.n_cols(),
        dims.total_nonzeros()
    );
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ArrowFrame;
    use crate::test_util::{batch, scenario_frame, scenario_layout};

    #[test]
    fn prefix_sums_and_ranges() {
        let dims = Dimensions::new(5, vec![2, 0, 3], Some(vec![4, 0, 7])).unwrap();
        assert_eq!(dims.n_chunks(), 3);
        assert_eq!(dims.row_bounds(), &[0, 2, 2, 5]);
        assert_eq!(dims.total_rows(), 5);
        assert_eq!(dims.total_nonzeros(), Some(11));
        assert_eq!(dims.row_range(2), 2..5);
        assert_eq!(dims.nonzero_range(1), Some(4..4));
        assert_eq!(dims.dense_cells(), Some(25));
        assert_eq!(dims.fill_ratio(), Some(11.0 / 25.0));
        assert!(!dims.rows_only().has_nonzeros());
    }

    #[test]
    fn empty_dimensions() {
        let dims = Dimensions::new(4, vec![], Some(vec![])).unwrap();
        assert_eq!(dims.total_rows(), 0);
        assert_eq!(dims.total_nonzeros(), Some(0));
        assert_eq!(dims.fill_ratio(), None);
    }

    #[test]
    fn reject_mismatched_counts() {
        assert!(Dimensions::new(3, vec![1, 2], Some(vec![1])).is_err());
        assert!(Dimensions::new(3, vec![usize::MAX, 1], None).is_err());
    }

    #[test]
    fn serialize_recomputes_bases() {
        let dims = Dimensions::new(3, vec![1, 2], Some(vec![3, 4])).unwrap();
        let bytes = postcard::to_allocvec(&dims).unwrap();
        let back: Dimensions = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, dims);
    }

    #[test]
    fn plan_scenario() {
        let layout = scenario_layout();
        let frame = scenario_frame();
        let bound = layout.bind(&frame).unwrap();
        let dims = plan(&frame, &bound, true).unwrap();
        assert_eq!(dims.row_counts(), &[2, 2]);
        assert_eq!(dims.total_rows(), 4);
        // one categorical entry per row, plus 1.5, NaN and 3.0
        assert_eq!(dims.nonzero_counts(), Some(&[3, 4][..]));
        assert_eq!(dims.total_nonzeros(), Some(7));
        assert_eq!(dims.n_cols(), 5);

        let rows = plan(&frame, &bound, false).unwrap();
        assert_eq!(rows.total_rows(), 4);
        assert_eq!(rows.total_nonzeros(), None);
    }

    #[test]
    fn tiny_weights_keep_rows() {
        let layout = scenario_layout();
        let frame = ArrowFrame::from_batches(vec![batch(
            vec![Some(0), Some(1), Some(2)],
            vec![Some(1.0), Some(2.0), Some(3.0)],
            vec![1.0, 1e-50, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![0.0, 0.0, 0.0],
        )])
        .unwrap();
        let bound = layout.bind(&frame).unwrap();
        let dims = plan(&frame, &bound, true).unwrap();
        assert_eq!(dims.total_rows(), 2);
        assert_eq!(dims.total_nonzeros(), Some(4));
    }
}
