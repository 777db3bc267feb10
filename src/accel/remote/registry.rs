// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Consumer-side registry of in-progress remote builds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::*;
use rustc_hash::FxHashMap;

use super::messages::{BuildKey, WireMessage};
use super::MessageSink;
use crate::config::StorageKind;
use crate::errors::{MatrixError, Result};
use crate::fill::SideArrays;
use crate::memory::MemoryBudget;
use crate::plan::Dimensions;
use crate::provider::MatrixProvider;
use crate::store::BackingStore;

/// Builds in progress, keyed by build id.
///
/// Patches for distinct chunks of one build may be applied concurrently;
/// they write disjoint ranges of the build's buffers. Any rejected message
/// abandons its build and releases the buffers.
pub struct UploadRegistry {
    capacity: usize,
    budget: Arc<MemoryBudget>,
    entries: RwLock<FxHashMap<BuildKey, Arc<UploadEntry>>>,
}

struct UploadEntry {
    dims: Dimensions,
    store: BackingStore,
    applied: Vec<AtomicBool>,
    data: Mutex<Option<PendingData>>,
}

struct PendingData {
    side: SideArrays,
    actual_rows: usize,
}

impl UploadRegistry {
    pub fn new(capacity: usize, budget: Arc<MemoryBudget>) -> UploadRegistry {
        UploadRegistry {
            capacity,
            budget,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Get the number of builds in progress.
    pub fn len(&self) -> usize {
        self.entries.read().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &BuildKey) -> bool {
        self.entries
            .read()
            .expect("poisoned lock")
            .contains_key(key)
    }

    /// Decode and apply an encoded message.
    pub fn apply_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.apply(WireMessage::decode(bytes)?)
    }

    /// Apply one message.
    pub fn apply(&self, msg: WireMessage) -> Result<()> {
        trace!("applying {} for {}", msg.name(), msg.key());
        match msg {
            WireMessage::InitSparse { key, dims } => self.init(key, dims, StorageKind::Sparse),
            WireMessage::InitDense { key, dims } => self.init(key, dims, StorageKind::Dense),
            WireMessage::SparseChunk {
                key,
                chunk,
                row_header,
                values,
                col_indices,
            } => {
                let entry = self.lookup(&key)?;
                let res = entry.apply_sparse(&key, chunk, &row_header, &col_indices, &values);
                self.abandon_on_err(&key, &entry, res)
            }
            WireMessage::DenseChunk { key, chunk, values } => {
                let entry = self.lookup(&key)?;
                let res = entry.apply_dense(&key, chunk, &values);
                self.abandon_on_err(&key, &entry, res)
            }
            WireMessage::MatrixData {
                key,
                response,
                weight,
                offset,
                actual_rows,
            } => {
                let entry = self.lookup(&key)?;
                let side = SideArrays {
                    response,
                    weight,
                    offset,
                };
                let res = entry.attach(&key, side, actual_rows);
                self.abandon_on_err(&key, &entry, res)
            }
            WireMessage::Cleanup { key } => {
                if self.remove(&key) {
                    info!("cleaned up remote build {}", key);
                } else {
                    debug!("cleanup for unknown build {}", key);
                }
                Ok(())
            }
        }
    }

    /// Finish a build, removing it from the registry.
    ///
    /// The entry is removed whether or not a provider can be built from it.
    pub fn finish(&self, key: &BuildKey) -> Result<MatrixProvider> {
        let entry = self
            .entries
            .write()
            .expect("poisoned lock")
            .remove(key)
            .ok_or_else(|| MatrixError::protocol(key, "unknown or cleaned build"))?;
        let entry = Arc::try_unwrap(entry)
            .map_err(|_| MatrixError::protocol(key, "chunk patches still in flight"))?;
        let res = entry.into_provider(key);
        match &res {
            Ok(p) => info!("finished remote build {} with {} rows", key, p.n_rows()),
            Err(e) => warn!("remote build {} failed: {}", key, e),
        }
        res
    }

    fn init(&self, key: BuildKey, dims: Dimensions, kind: StorageKind) -> Result<()> {
        if kind == StorageKind::Sparse && !dims.has_nonzeros() {
            return Err(MatrixError::protocol(&key, "sparse init without nonzero counts"));
        }
        let store = BackingStore::allocate(&dims, kind, self.capacity, &self.budget)?;
        let applied = (0..dims.n_chunks()).map(|_| AtomicBool::new(false)).collect();
        let entry = Arc::new(UploadEntry {
            dims,
            store,
            applied,
            data: Mutex::new(None),
        });

        let mut map = self.entries.write().expect("poisoned lock");
        if map.remove(&key).is_some() {
            drop(map);
            warn!("duplicate init for remote build {}, abandoning", key);
            return Err(MatrixError::protocol(&key, "build already initialized"));
        }
        debug!(
            "registered {} remote build {} ({} bytes)",
            kind,
            key,
            entry.store.allocated_bytes()
        );
        map.insert(key, entry);
        Ok(())
    }

    fn lookup(&self, key: &BuildKey) -> Result<Arc<UploadEntry>> {
        self.entries
            .read()
            .expect("poisoned lock")
            .get(key)
            .cloned()
            .ok_or_else(|| MatrixError::protocol(key, "unknown or cleaned build"))
    }

    fn remove(&self, key: &BuildKey) -> bool {
        self.entries
            .write()
            .expect("poisoned lock")
            .remove(key)
            .is_some()
    }

    /// Abandon a build after a rejected message.
    ///
    /// Only `entry` is removed; if the key has since been cleaned up and
    /// initialized again, the newer build is left alone.
    fn abandon_on_err(
        &self,
        key: &BuildKey,
        entry: &Arc<UploadEntry>,
        res: Result<()>,
    ) -> Result<()> {
        if let Err(e) = &res {
            let mut map = self.entries.write().expect("poisoned lock");
            if map.get(key).is_some_and(|cur| Arc::ptr_eq(cur, entry)) {
                map.remove(key);
                warn!("abandoning remote build {}: {}", key, e);
            } else {
                debug!("rejected stale message for build {}: {}", key, e);
            }
        }
        res
    }
}

impl MessageSink for UploadRegistry {
    fn send(&self, msg: WireMessage) -> Result<()> {
        self.apply(msg)
    }
}

impl UploadEntry {
    fn check_chunk(&self, key: &BuildKey, chunk: usize) -> Result<()> {
        if chunk >= self.dims.n_chunks() {
            return Err(MatrixError::protocol(
                key,
                format!("chunk {} out of range ({} chunks)", chunk, self.dims.n_chunks()),
            ));
        }
        Ok(())
    }

    /// Mark a chunk as applied, rejecting repeats.
    fn claim(&self, key: &BuildKey, chunk: usize) -> Result<()> {
        if self.applied[chunk].swap(true, Ordering::AcqRel) {
            Err(MatrixError::protocol(
                key,
                format!("chunk {} applied twice", chunk),
            ))
        } else {
            Ok(())
        }
    }

    fn apply_sparse(
        &self,
        key: &BuildKey,
        chunk: usize,
        header: &[i64],
        col_inds: &[i32],
        values: &[f32],
    ) -> Result<()> {
        let cs = match &self.store {
            BackingStore::Sparse(cs) => cs,
            BackingStore::Dense(_) => {
                return Err(MatrixError::protocol(key, "sparse chunk for dense build"))
            }
        };
        self.check_chunk(key, chunk)?;
        let rows = self.dims.row_counts()[chunk];
        let range = self
            .dims
            .nonzero_range(chunk)
            .ok_or_else(|| MatrixError::protocol(key, "build has no nonzero counts"))?;
        let bad = |msg: String| Err(MatrixError::protocol(key, format!("chunk {}: {}", chunk, msg)));

        if header.len() != rows + 1 {
            return bad(format!("{} row pointers for {} rows", header.len(), rows + 1));
        }
        if col_inds.len() != range.len() || values.len() != range.len() {
            return bad(format!(
                "{} indices and {} values for {} entries",
                col_inds.len(),
                values.len(),
                range.len()
            ));
        }
        if header[0] != range.start as i64 || header[rows] != range.end as i64 {
            return bad(format!(
                "row pointers span {}..{}, expected {}..{}",
                header[0], header[rows], range.start, range.end
            ));
        }
        if header.windows(2).any(|w| w[0] > w[1]) {
            return bad("row pointers are not monotone".into());
        }
        let n_cols = self.dims.n_cols();
        if col_inds.iter().any(|c| *c < 0 || *c as usize >= n_cols) {
            return bad(format!("column index outside 0..{}", n_cols));
        }
        self.claim(key, chunk)?;

        let row_start = self.dims.row_range(chunk).start;
        // SAFETY: the claim admits one writer per chunk, chunk ranges are
        // disjoint prefix-sum ranges, and nothing reads the buffers until
        // `finish` holds the only reference to the entry.
        unsafe {
            cs.row_ptrs.write_at(row_start, &header[..rows]);
            if chunk + 1 == self.dims.n_chunks() {
                cs.row_ptrs.write_at(self.dims.total_rows(), &header[rows..]);
            }
            cs.col_inds.write_at(range.start, col_inds);
            cs.values.write_at(range.start, values);
        }
        Ok(())
    }

    fn apply_dense(&self, key: &BuildKey, chunk: usize, values: &[f32]) -> Result<()> {
        let ds = match &self.store {
            BackingStore::Dense(ds) => ds,
            BackingStore::Sparse(_) => {
                return Err(MatrixError::protocol(key, "dense chunk for sparse build"))
            }
        };
        self.check_chunk(key, chunk)?;
        let rows = self.dims.row_range(chunk);
        let start = rows.start * ds.n_cols;
        let expected = rows.len() * ds.n_cols;
        if values.len() != expected {
            return Err(MatrixError::protocol(
                key,
                format!(
                    "chunk {}: {} cells, expected {}",
                    chunk,
                    values.len(),
                    expected
                ),
            ));
        }
        self.claim(key, chunk)?;
        // SAFETY: as for sparse chunks
        unsafe {
            ds.data.write_at(start, values);
        }
        Ok(())
    }

    fn attach(&self, key: &BuildKey, side: SideArrays, actual_rows: usize) -> Result<()> {
        side.check()
            .map_err(|e| MatrixError::protocol(key, format!("{}", e)))?;
        if side.len() != actual_rows {
            return Err(MatrixError::protocol(
                key,
                format!("{} responses for {} rows", side.len(), actual_rows),
            ));
        }
        let mut data = self.data.lock().expect("poisoned lock");
        if data.is_some() {
            return Err(MatrixError::protocol(key, "matrix data sent twice"));
        }
        *data = Some(PendingData { side, actual_rows });
        Ok(())
    }

    fn into_provider(self, key: &BuildKey) -> Result<MatrixProvider> {
        let missing = self
            .applied
            .iter()
            .filter(|a| !a.load(Ordering::Acquire))
            .count();
        if missing > 0 {
            return Err(MatrixError::protocol(
                key,
                format!("{} of {} chunks never arrived", missing, self.applied.len()),
            ));
        }
        let data = self
            .data
            .into_inner()
            .expect("poisoned lock")
            .ok_or_else(|| MatrixError::protocol(key, "matrix data never arrived"))?;
        let total = self.dims.total_rows();
        if data.actual_rows != total {
            return Err(MatrixError::protocol(
                key,
                format!("{} actual rows, planned {}", data.actual_rows, total),
            ));
        }
        let mut store = self.store;
        if let BackingStore::Sparse(cs) = &mut store {
            if self.dims.n_chunks() == 0 {
                cs.row_ptrs.set(0, 0);
            }
        }
        MatrixProvider::new(store, data.side, data.actual_rows)
    }
}
