// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Column roles and the one-hot matrix layout.
//!
//! Categorical columns come first, each expanded to `cardinality + 1`
//! columns; the final slot of each sub-range records a missing level.
//! Numeric columns follow the last categorical sub-range, one column each.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::errors::{MatrixError, Result};
use crate::frame::{ChunkRows, ColumnAccess, ColumnRequest, Frame};

/// The role a column plays in the matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ColumnRole {
    /// Integer-coded levels in `0..cardinality`, one-hot encoded.
    Categorical { cardinality: u32 },
    Numeric,
    /// Row weight; rows of weight zero are dropped.
    Weight,
    /// Base margin.
    Offset,
    /// Training label.
    Response,
    Ignored,
}

/// A named column with its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(flatten)]
    pub role: ColumnRole,
}

impl ColumnSpec {
    pub fn new<S: Into<String>>(name: S, role: ColumnRole) -> Self {
        ColumnSpec {
            name: name.into(),
            role,
        }
    }

    pub fn categorical<S: Into<String>>(name: S, cardinality: u32) -> Self {
        Self::new(name, ColumnRole::Categorical { cardinality })
    }

    pub fn numeric<S: Into<String>>(name: S) -> Self {
        Self::new(name, ColumnRole::Numeric)
    }

    pub fn weight<S: Into<String>>(name: S) -> Self {
        Self::new(name, ColumnRole::Weight)
    }

    pub fn offset<S: Into<String>>(name: S) -> Self {
        Self::new(name, ColumnRole::Offset)
    }

    pub fn response<S: Into<String>>(name: S) -> Self {
        Self::new(name, ColumnRole::Response)
    }
}

/// Validated column layout of the output matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixLayout {
    categoricals: Vec<String>,
    cardinalities: Vec<u32>,
    numerics: Vec<String>,
    response: String,
    weight: Option<String>,
    offset: Option<String>,
    cat_offsets: Vec<usize>,
    full_width: usize,
}

impl MatrixLayout {
    /// Build the layout from column specifications.
    pub fn new(columns: &[ColumnSpec]) -> Result<Self> {
        let mut seen = FxHashSet::default();
        let mut categoricals = Vec::new();
        let mut cardinalities = Vec::new();
        let mut numerics = Vec::new();
        let mut response = None;
        let mut weight = None;
        let mut offset = None;

        for col in columns {
            if !seen.insert(col.name.as_str()) {
                return Err(MatrixError::Config(format!(
                    "duplicate column {}",
                    col.name
                )));
            }
            match &col.role {
                ColumnRole::Categorical { cardinality } => {
                    if *cardinality == 0 {
                        return Err(MatrixError::Config(format!(
                            "categorical column {} has no levels",
                            col.name
                        )));
                    }
                    categoricals.push(col.name.clone());
                    cardinalities.push(*cardinality);
                }
                ColumnRole::Numeric => numerics.push(col.name.clone()),
                ColumnRole::Response => set_once(&mut response, &col.name, "response")?,
                ColumnRole::Weight => set_once(&mut weight, &col.name, "weight")?,
                ColumnRole::Offset => set_once(&mut offset, &col.name, "offset")?,
                ColumnRole::Ignored => (),
            }
        }

        if categoricals.is_empty() && numerics.is_empty() {
            return Err(MatrixError::Config("no feature columns".into()));
        }
        let response =
            response.ok_or_else(|| MatrixError::Config("no response column".into()))?;

        let mut cat_offsets = Vec::with_capacity(categoricals.len() + 1);
        let mut pos = 0usize;
        cat_offsets.push(pos);
        for card in &cardinalities {
            pos += *card as usize + 1;
            cat_offsets.push(pos);
        }
        let full_width = pos + numerics.len();
        if full_width > i32::MAX as usize {
            return Err(MatrixError::Config(format!(
                "matrix width {} exceeds 32-bit column indices",
                full_width
            )));
        }

        Ok(MatrixLayout {
            categoricals,
            cardinalities,
            numerics,
            response,
            weight,
            offset,
            cat_offsets,
            full_width,
        })
    }

    /// Parse column specifications from a JSON list.
    pub fn from_json(json: &str) -> Result<Self> {
        let cols: Vec<ColumnSpec> = serde_json::from_str(json)?;
        Self::new(&cols)
    }

    pub fn n_categorical(&self) -> usize {
        self.categoricals.len()
    }

    pub fn n_numeric(&self) -> usize {
        self.numerics.len()
    }

    /// Get the start of each categorical sub-range, plus the end of the last.
    pub fn categorical_offsets(&self) -> &[usize] {
        &self.cat_offsets
    }

    pub fn cardinalities(&self) -> &[u32] {
        &self.cardinalities
    }

    /// Get the column index of the first numeric column.
    pub fn numeric_base(&self) -> usize {
        self.cat_offsets[self.categoricals.len()]
    }

    /// Get the total number of matrix columns.
    pub fn full_width(&self) -> usize {
        self.full_width
    }

    pub fn has_weight(&self) -> bool {
        self.weight.is_some()
    }

    pub fn has_offset(&self) -> bool {
        self.offset.is_some()
    }

    /// Resolve column positions in a frame.
    pub fn bind<F: Frame>(&self, frame: &F) -> Result<BoundLayout<'_>> {
        let find = |name: &str, access: ColumnAccess| {
            frame
                .column_position(name)
                .map(|position| ColumnRequest { position, access })
                .ok_or_else(|| MatrixError::Config(format!("frame has no column {}", name)))
        };

        let mut requests = Vec::new();
        for name in &self.categoricals {
            requests.push(find(name.as_str(), ColumnAccess::Level)?);
        }
        for name in self.numerics.iter().chain(std::iter::once(&self.response)) {
            requests.push(find(name.as_str(), ColumnAccess::Numeric)?);
        }
        let response_col = requests.len() - 1;
        let weight_col = match &self.weight {
            Some(w) => {
                requests.push(find(w.as_str(), ColumnAccess::Numeric)?);
                Some(requests.len() - 1)
            }
            None => None,
        };
        let offset_col = match &self.offset {
            Some(o) => {
                requests.push(find(o.as_str(), ColumnAccess::Numeric)?);
                Some(requests.len() - 1)
            }
            None => None,
        };

        Ok(BoundLayout {
            layout: self,
            requests,
            response_col,
            weight_col,
            offset_col,
        })
    }
}

fn set_once(slot: &mut Option<String>, name: &str, what: &str) -> Result<()> {
    if let Some(prev) = slot {
        return Err(MatrixError::Config(format!(
            "multiple {} columns ({} and {})",
            what, prev, name
        )));
    }
    *slot = Some(name.to_string());
    Ok(())
}

/// A layout resolved against a frame's columns.
///
/// Row decoding lives here so that the planning and fill passes make the
/// same decisions from the same values.
#[derive(Debug, Clone)]
pub struct BoundLayout<'a> {
    layout: &'a MatrixLayout,
    requests: Vec<ColumnRequest>,
    response_col: usize,
    weight_col: Option<usize>,
    offset_col: Option<usize>,
}

impl<'a> BoundLayout<'a> {
    pub fn layout(&self) -> &'a MatrixLayout {
        self.layout
    }

    /// Get the columns to load from each chunk.
    pub fn requests(&self) -> &[ColumnRequest] {
        &self.requests
    }

    pub fn n_cols(&self) -> usize {
        self.layout.full_width
    }

    pub fn n_categorical(&self) -> usize {
        self.layout.n_categorical()
    }

    pub fn n_numeric(&self) -> usize {
        self.layout.n_numeric()
    }

    pub fn numeric_base(&self) -> usize {
        self.layout.numeric_base()
    }

    /// Get a row's weight as stored in the side array, 1.0 without a weight
    /// column.
    pub fn row_weight<C: ChunkRows>(&self, chunk: &C, row: usize) -> f32 {
        match self.weight_col {
            Some(c) => chunk.value(c, row) as f32,
            None => 1.0,
        }
    }

    /// Check whether a row is kept in the matrix.
    ///
    /// The test uses the full-precision weight, so tiny weights that round
    /// to zero as `f32` still keep their row. NaN weights are kept.
    pub fn survives<C: ChunkRows>(&self, chunk: &C, row: usize) -> bool {
        match self.weight_col {
            Some(c) => chunk.value(c, row) != 0.0,
            None => true,
        }
    }

    /// Get numeric feature `j` as stored in the matrix.
    pub fn numeric_value<C: ChunkRows>(&self, chunk: &C, j: usize, row: usize) -> f32 {
        chunk.value(self.layout.n_categorical() + j, row) as f32
    }

    /// Get the matrix column set for categorical feature `i`.
    pub fn categorical_column<C: ChunkRows>(
        &self,
        chunk: &C,
        chunk_idx: usize,
        i: usize,
        row: usize,
    ) -> Result<usize> {
        let card = self.layout.cardinalities[i];
        let base = self.layout.cat_offsets[i];
        match chunk.level(i, row) {
            None => Ok(base + card as usize),
            Some(l) if l >= 0 && l < card as i64 => Ok(base + l as usize),
            Some(l) => Err(MatrixError::data(
                chunk_idx,
                format!(
                    "level {} of column {} outside 0..{}",
                    l, self.layout.categoricals[i], card
                ),
            )),
        }
    }

    /// Count the sparse entries of a surviving row.
    ///
    /// Every categorical column contributes one entry, including missing
    /// levels; numerics contribute when nonzero, and NaN counts.
    pub fn row_nonzeros<C: ChunkRows>(&self, chunk: &C, row: usize) -> usize {
        let nnum = (0..self.n_numeric())
            .filter(|j| self.numeric_value(chunk, *j, row) != 0.0)
            .count();
        self.n_categorical() + nnum
    }

    pub fn response<C: ChunkRows>(&self, chunk: &C, row: usize) -> f32 {
        chunk.value(self.response_col, row) as f32
    }

    pub fn offset<C: ChunkRows>(&self, chunk: &C, row: usize) -> Option<f32> {
        self.offset_col.map(|c| chunk.value(c, row) as f32)
    }
}
