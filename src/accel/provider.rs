// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Filled matrices awaiting handoff to the native library.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::*;
use serde::{Deserialize, Serialize};

use crate::config::StorageKind;
use crate::errors::{MatrixError, Result};
use crate::fill::SideArrays;
use crate::memory::MemoryBudget;
use crate::native::{DMatrixBackend, DMatrixHandle, SparseFormat};
use crate::remote::BuildKey;
use crate::segmented::SegmentedArray;
use crate::store::{BackingStore, CsrStore, DenseStore};

/// Owns a filled backing store and its side arrays.
///
/// A provider is consumed by a single call to [MatrixProvider::materialize];
/// the backing store is released when that call returns, whether or not
/// native construction succeeded.
#[derive(Debug)]
pub struct MatrixProvider {
    store: Option<BackingStore>,
    side: SideArrays,
    n_cols: usize,
    actual_rows: usize,
}

impl MatrixProvider {
    pub(crate) fn new(store: BackingStore, side: SideArrays, actual_rows: usize) -> Result<Self> {
        side.check()?;
        if store.n_rows() != actual_rows || side.len() != actual_rows {
            return Err(MatrixError::Consistency(format!(
                "store has {} rows and side arrays {}, expected {}",
                store.n_rows(),
                side.len(),
                actual_rows
            )));
        }
        Ok(MatrixProvider {
            n_cols: store.n_cols(),
            store: Some(store),
            side,
            actual_rows,
        })
    }

    /// Get the storage kind, or `None` once consumed.
    pub fn kind(&self) -> Option<StorageKind> {
        self.store.as_ref().map(BackingStore::kind)
    }

    pub fn n_rows(&self) -> usize {
        self.actual_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn is_consumed(&self) -> bool {
        self.store.is_none()
    }

    /// Get the backing store, if not yet consumed.
    pub fn store(&self) -> Option<&BackingStore> {
        self.store.as_ref()
    }

    pub fn side(&self) -> &SideArrays {
        &self.side
    }

    /// Build the native matrix and release the backing store.
    pub fn materialize<B: DMatrixBackend>(&mut self, backend: &B) -> Result<B::Matrix> {
        let store = self.store.take().ok_or(MatrixError::Consumed)?;
        let side = std::mem::take(&mut self.side);
        let result = build_native(backend, &store, &side, self.actual_rows);
        drop(store);
        match &result {
            Ok(_) => debug!("materialized {} x {} matrix", self.actual_rows, self.n_cols),
            Err(e) => warn!("native matrix construction failed: {}", e),
        }
        result
    }

    /// Serialize the provider to `{dir}/{key}.dmatrix`, releasing its buffers.
    pub fn write_handoff(mut self, dir: &Path, key: &BuildKey) -> Result<PathBuf> {
        let store = self.store.take().ok_or(MatrixError::Consumed)?;
        let payload = ProviderPayload::capture(&store, &self.side, self.actual_rows);
        drop(store);
        let bytes = postcard::to_allocvec(&payload)?;

        let path = handoff_path(dir, key);
        let tmp = dir.join(format!("{}.dmatrix.tmp", key));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        info!(
            "wrote {} matrix handoff of {} bytes to {}",
            payload.kind(),
            bytes.len(),
            path.display()
        );
        Ok(path)
    }

    /// Read a handoff file written by [MatrixProvider::write_handoff].
    ///
    /// The file is deleted as soon as it has been decoded, so each handoff
    /// can be taken once.
    pub fn take_handoff(dir: &Path, key: &BuildKey, budget: &Arc<MemoryBudget>) -> Result<Self> {
        let path = handoff_path(dir, key);
        let bytes = fs::read(&path)?;
        let payload: ProviderPayload = postcard::from_bytes(&bytes)?;
        fs::remove_file(&path)?;
        debug!("took matrix handoff {}", path.display());
        payload.restore(budget)
    }
}

fn handoff_path(dir: &Path, key: &BuildKey) -> PathBuf {
    dir.join(format!("{}.dmatrix", key))
}

fn build_native<B: DMatrixBackend>(
    backend: &B,
    store: &BackingStore,
    side: &SideArrays,
    n_rows: usize,
) -> Result<B::Matrix> {
    let mut matrix = match store {
        BackingStore::Dense(ds) => backend.build_dense(&ds.data, n_rows, ds.n_cols, f32::NAN)?,
        BackingStore::Sparse(cs) => backend.build_sparse(
            &cs.row_ptrs,
            &cs.col_inds,
            &cs.values,
            SparseFormat::Csr,
            cs.n_cols,
            n_rows + 1,
            cs.values.len(),
        )?,
    };
    matrix.set_label(&side.response)?;
    if let Some(w) = &side.weight {
        matrix.set_weight(w)?;
    }
    if let Some(o) = &side.offset {
        matrix.set_base_margin(o)?;
    }
    Ok(matrix)
}

/// Serialized provider contents.
#[derive(Debug, Serialize, Deserialize)]
struct ProviderPayload {
    n_rows: usize,
    n_cols: usize,
    capacity: usize,
    buffers: PayloadBuffers,
    response: Vec<f32>,
    weight: Option<Vec<f32>>,
    offset: Option<Vec<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
enum PayloadBuffers {
    Dense {
        data: Vec<Vec<f32>>,
    },
    Sparse {
        row_ptrs: Vec<Vec<i64>>,
        col_inds: Vec<Vec<i32>>,
        values: Vec<Vec<f32>>,
    },
}

impl ProviderPayload {
    fn capture(store: &BackingStore, side: &SideArrays, n_rows: usize) -> Self {
        let (capacity, buffers) = match store {
            BackingStore::Dense(ds) => (
                ds.data.capacity(),
                PayloadBuffers::Dense {
                    data: ds.data.segment_vecs(),
                },
            ),
            BackingStore::Sparse(cs) => (
                cs.row_ptrs.capacity(),
                PayloadBuffers::Sparse {
                    row_ptrs: cs.row_ptrs.segment_vecs(),
                    col_inds: cs.col_inds.segment_vecs(),
                    values: cs.values.segment_vecs(),
                },
            ),
        };
        ProviderPayload {
            n_rows,
            n_cols: store.n_cols(),
            capacity,
            buffers,
            response: side.response.clone(),
            weight: side.weight.clone(),
            offset: side.offset.clone(),
        }
    }

    fn kind(&self) -> StorageKind {
        match self.buffers {
            PayloadBuffers::Dense { .. } => StorageKind::Dense,
            PayloadBuffers::Sparse { .. } => StorageKind::Sparse,
        }
    }

    fn restore(self, budget: &Arc<MemoryBudget>) -> Result<MatrixProvider> {
        let cap = self.capacity;
        let n_rows = self.n_rows;
        let n_cols = self.n_cols;
        let store = match self.buffers {
            PayloadBuffers::Dense { data } => BackingStore::Dense(DenseStore {
                data: SegmentedArray::from_segments(data, cap, budget)?,
                n_rows,
                n_cols,
            }),
            PayloadBuffers::Sparse {
                row_ptrs,
                col_inds,
                values,
            } => BackingStore::Sparse(CsrStore {
                row_ptrs: SegmentedArray::from_segments(row_ptrs, cap, budget)?,
                col_inds: SegmentedArray::from_segments(col_inds, cap, budget)?,
                values: SegmentedArray::from_segments(values, cap, budget)?,
                n_rows,
                n_cols,
            }),
        };
        let side = SideArrays {
            response: self.response,
            weight: self.weight,
            offset: self.offset,
        };
        MatrixProvider::new(store, side, n_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill::fill_local;
    use crate::native::InMemoryBackend;
    use crate::plan::plan;
    use crate::test_util::{scenario_frame, scenario_layout};

    fn provider(kind: StorageKind, budget: &Arc<MemoryBudget>) -> MatrixProvider {
        let layout = scenario_layout();
        let frame = scenario_frame();
        let bound = layout.bind(&frame).unwrap();
        let dims = plan(&frame, &bound, true).unwrap();
        let mut store = BackingStore::allocate(&dims, kind, 3, budget).unwrap();
        let mut side = SideArrays::allocate(dims.total_rows(), true, true);
        fill_local(&frame, &bound, &dims, &mut store, &mut side).unwrap();
        MatrixProvider::new(store, side, dims.total_rows()).unwrap()
    }

    #[test]
    fn materialize_once() {
        let budget = MemoryBudget::unbounded();
        let mut p = provider(StorageKind::Sparse, &budget);
        assert!(budget.in_use() > 0);
        let m = p.materialize(&InMemoryBackend).unwrap();
        assert_eq!(budget.in_use(), 0);
        assert!(p.is_consumed());
        assert_eq!(m.n_rows(), 4);
        assert_eq!(m.label(), Some(&[1.0, 1.0, 0.0, 1.0][..]));
        assert!(matches!(
            p.materialize(&InMemoryBackend),
            Err(MatrixError::Consumed)
        ));
    }

    struct FailingBackend;

    impl DMatrixBackend for FailingBackend {
        type Matrix = crate::native::InMemoryDMatrix;

        fn build_dense(
            &self,
            _data: &SegmentedArray<f32>,
            _n_rows: usize,
            _n_cols: usize,
            _missing: f32,
        ) -> Result<Self::Matrix> {
            Err(MatrixError::Native("refused".into()))
        }

        fn build_sparse(
            &self,
            _row_ptrs: &SegmentedArray<i64>,
            _col_inds: &SegmentedArray<i32>,
            _values: &SegmentedArray<f32>,
            _format: SparseFormat,
            _n_cols: usize,
            _n_row_ptrs: usize,
            _nnz: usize,
        ) -> Result<Self::Matrix> {
            Err(MatrixError::Native("refused".into()))
        }
    }

    #[test]
    fn failed_materialize_releases_store() {
        let budget = MemoryBudget::unbounded();
        let mut p = provider(StorageKind::Dense, &budget);
        assert!(matches!(
            p.materialize(&FailingBackend),
            Err(MatrixError::Native(_))
        ));
        assert_eq!(budget.in_use(), 0);
        assert!(matches!(
            p.materialize(&InMemoryBackend),
            Err(MatrixError::Consumed)
        ));
    }

    #[test]
    fn handoff_read_once() {
        let dir = tempfile::tempdir().unwrap();
        let key = BuildKey::new("job-7").unwrap();
        let budget = MemoryBudget::unbounded();
        let p = provider(StorageKind::Sparse, &budget);
        let expected = p.store().map(|s| match s {
            BackingStore::Sparse(cs) => cs.values.to_vec(),
            _ => unreachable!(),
        });
        let path = p.write_handoff(dir.path(), &key).unwrap();
        assert!(path.exists());
        assert_eq!(budget.in_use(), 0);

        let mut back = MatrixProvider::take_handoff(dir.path(), &key, &budget).unwrap();
        assert!(!path.exists());
        assert_eq!(back.kind(), Some(StorageKind::Sparse));
        let got = back.store().map(|s| match s {
            BackingStore::Sparse(cs) => cs.values.to_vec(),
            _ => unreachable!(),
        });
        let bits = |v: Option<Vec<f32>>| v.unwrap().iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(got), bits(expected));

        let m = back.materialize(&InMemoryBackend).unwrap();
        assert_eq!(m.base_margin().map(|m| m.len()), Some(4));
        assert!(matches!(
            MatrixProvider::take_handoff(dir.path(), &key, &budget),
            Err(MatrixError::Io(_))
        ));
    }
}
