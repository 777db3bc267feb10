// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Entry point tying planning, allocation and fill together.

use std::sync::Arc;

use log::*;

use crate::config::{BuildConfig, MatrixKind, StorageKind};
use crate::errors::Result;
use crate::fill::{fill_local, SideArrays};
use crate::frame::Frame;
use crate::memory::MemoryBudget;
use crate::plan::{plan, Dimensions};
use crate::provider::MatrixProvider;
use crate::remote::{self, BuildKey, MessageSink, UploadRegistry};
use crate::schema::{BoundLayout, MatrixLayout};
use crate::store::BackingStore;

/// Builds boosting matrices from chunked frames.
#[derive(Debug, Clone)]
pub struct MatrixBuilder {
    layout: MatrixLayout,
    config: BuildConfig,
    budget: Arc<MemoryBudget>,
}

impl MatrixBuilder {
    /// Create a builder, validating the configuration.
    pub fn new(layout: MatrixLayout, config: BuildConfig) -> Result<MatrixBuilder> {
        config.validate()?;
        let budget = match config.memory_limit {
            Some(lim) => MemoryBudget::with_limit(lim),
            None => MemoryBudget::unbounded(),
        };
        Ok(MatrixBuilder {
            layout,
            config,
            budget,
        })
    }

    /// Use a shared memory budget instead of the configured one.
    pub fn with_budget(mut self, budget: Arc<MemoryBudget>) -> MatrixBuilder {
        self.budget = budget;
        self
    }

    pub fn layout(&self) -> &MatrixLayout {
        &self.layout
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Plan a frame and pick its storage kind.
    pub fn plan<F: Frame>(&self, frame: &F) -> Result<(Dimensions, StorageKind)> {
        let bound = self.layout.bind(frame)?;
        self.plan_bound(frame, &bound)
    }

    fn plan_bound<F: Frame>(
        &self,
        frame: &F,
        bound: &BoundLayout<'_>,
    ) -> Result<(Dimensions, StorageKind)> {
        let count_nonzeros = self.config.kind != MatrixKind::Dense;
        let dims = plan(frame, bound, count_nonzeros)?;
        let kind = self.resolve_kind(&dims);
        info!(
            "building {} matrix of {} rows x {} columns (fill ratio {:?})",
            kind,
            dims.total_rows(),
            dims.n_cols(),
            dims.fill_ratio()
        );
        Ok((dims, kind))
    }

    /// Pick the storage kind for planned dimensions.
    ///
    /// A forced kind wins. Otherwise sparse storage is used when the fill
    /// ratio is below the threshold or the dense matrix would exceed 32-bit
    /// cell indices; an empty matrix is dense.
    pub fn resolve_kind(&self, dims: &Dimensions) -> StorageKind {
        if let Some(kind) = self.config.kind.forced() {
            return kind;
        }
        if dims.total_rows() == 0 {
            return StorageKind::Dense;
        }
        let cells = dims.total_rows() as f64 * dims.n_cols() as f64;
        if cells > i32::MAX as f64 {
            return StorageKind::Sparse;
        }
        match dims.fill_ratio() {
            Some(r) if r < self.config.fill_ratio_threshold => StorageKind::Sparse,
            _ => StorageKind::Dense,
        }
    }

    /// Build a matrix in this process.
    pub fn build<F: Frame>(&self, frame: &F) -> Result<MatrixProvider> {
        let bound = self.layout.bind(frame)?;
        let (dims, kind) = self.plan_bound(frame, &bound)?;
        let mut store =
            BackingStore::allocate(&dims, kind, self.config.segment_capacity, &self.budget)?;
        let mut side = SideArrays::allocate(
            dims.total_rows(),
            self.layout.has_weight(),
            self.layout.has_offset(),
        );
        fill_local(frame, &bound, &dims, &mut store, &mut side)?;
        MatrixProvider::new(store, side, dims.total_rows())
    }

    /// Plan and fill a frame here, sending the result to a remote consumer.
    pub fn upload<F: Frame, S: MessageSink + ?Sized>(
        &self,
        frame: &F,
        key: &BuildKey,
        sink: &S,
    ) -> Result<()> {
        let bound = self.layout.bind(frame)?;
        let (dims, kind) = self.plan_bound(frame, &bound)?;
        remote::upload(frame, &bound, &dims, kind, key, sink)
    }

    /// Create a consumer registry sharing this builder's segment size and budget.
    pub fn registry(&self) -> UploadRegistry {
        UploadRegistry::new(self.config.segment_capacity, self.budget.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{scenario_frame, scenario_layout};

    fn builder(kind: MatrixKind) -> MatrixBuilder {
        let cfg = BuildConfig::default()
            .with_kind(kind)
            .with_segment_capacity(4);
        MatrixBuilder::new(scenario_layout(), cfg).unwrap()
    }

    #[test]
    fn auto_kind_uses_fill_ratio() {
        let b = builder(MatrixKind::Auto);
        let dense = Dimensions::new(5, vec![4], Some(vec![7])).unwrap();
        assert_eq!(b.resolve_kind(&dense), StorageKind::Dense);
        let sparse = Dimensions::new(100, vec![4], Some(vec![7])).unwrap();
        assert_eq!(b.resolve_kind(&sparse), StorageKind::Sparse);
        let empty = Dimensions::new(100, vec![0], Some(vec![0])).unwrap();
        assert_eq!(b.resolve_kind(&empty), StorageKind::Dense);
        let huge = Dimensions::new(1 << 20, vec![1 << 12], Some(vec![1 << 40])).unwrap();
        assert_eq!(b.resolve_kind(&huge), StorageKind::Sparse);
    }

    #[test]
    fn forced_kind() {
        let sparse = Dimensions::new(100, vec![4], Some(vec![7])).unwrap();
        assert_eq!(
            builder(MatrixKind::Dense).resolve_kind(&sparse),
            StorageKind::Dense
        );
        let (dims, kind) = builder(MatrixKind::Dense).plan(&scenario_frame()).unwrap();
        assert_eq!(kind, StorageKind::Dense);
        assert!(!dims.has_nonzeros());
    }

    #[test]
    fn build_scenario() {
        let b = builder(MatrixKind::Sparse);
        let p = b.build(&scenario_frame()).unwrap();
        assert_eq!(p.n_rows(), 4);
        assert_eq!(p.n_cols(), 5);
        assert_eq!(p.kind(), Some(StorageKind::Sparse));
        assert!(b.budget().in_use() > 0);
        drop(p);
        assert_eq!(b.budget().in_use(), 0);
    }

    #[test]
    fn memory_limit_refuses_build() {
        let cfg = BuildConfig {
            memory_limit: Some(16),
            ..BuildConfig::default()
        }
        .with_kind(MatrixKind::Dense);
        let b = MatrixBuilder::new(scenario_layout(), cfg).unwrap();
        assert!(matches!(
            b.build(&scenario_frame()),
            Err(crate::errors::MatrixError::Allocation { .. })
        ));
        assert_eq!(b.budget().in_use(), 0);
    }

    #[test]
    fn wide_level_code_is_not_missing() {
        use std::sync::Arc;

        use arrow::array::{ArrayRef, Float64Array, Int64Array, RecordBatch};
        use arrow_schema::{DataType, Field, Schema};

        use crate::frame::ArrowFrame;

        let schema = Arc::new(Schema::new(vec![
            Field::new("c", DataType::Int64, true),
            Field::new("x", DataType::Float64, true),
            Field::new("w", DataType::Float64, false),
            Field::new("y", DataType::Float64, false),
            Field::new("o", DataType::Float64, false),
        ]));
        let ones = || -> ArrayRef { Arc::new(Float64Array::from(vec![1.0, 1.0])) };
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![0, 5_000_000_000])),
                ones(),
                ones(),
                ones(),
                ones(),
            ],
        )
        .unwrap();
        let frame = ArrowFrame::from_batches(vec![batch]).unwrap();
        for kind in [MatrixKind::Sparse, MatrixKind::Dense] {
            let b = builder(kind);
            assert!(matches!(
                b.build(&frame),
                Err(crate::errors::MatrixError::Data { chunk: 0, .. })
            ));
            assert_eq!(b.budget().in_use(), 0);
        }
    }
}
