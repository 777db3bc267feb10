// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Parallel materialization of chunked columnar data into boosting matrices.
//!
//! A build runs in two passes over the chunks of a [Frame]. Planning counts
//! surviving rows (and sparse entries) per chunk and turns the counts into
//! prefix sums; the backing buffers are then allocated at exactly the
//! planned size, and fill workers write each chunk into its own disjoint
//! range without locking. The result is a [MatrixProvider] that hands the
//! buffers to a [DMatrixBackend] once.
//!
//! The fill can also run on a different process from the one building the
//! matrix; see [remote].

pub mod builder;
pub mod config;
pub mod errors;
pub mod fill;
pub mod frame;
pub mod memory;
pub mod native;
pub mod parallel;
pub mod plan;
mod progress;
pub mod provider;
pub mod remote;
pub mod schema;
pub mod segmented;
pub mod store;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod test_util;

pub use builder::MatrixBuilder;
pub use config::{BuildConfig, MatrixKind, StorageKind};
pub use errors::{MatrixError, Result};
pub use fill::SideArrays;
pub use frame::{ArrowFrame, ChunkRows, Frame};
pub use memory::MemoryBudget;
pub use native::{DMatrixBackend, DMatrixHandle, InMemoryBackend, InMemoryDMatrix, SparseFormat};
pub use plan::Dimensions;
pub use provider::MatrixProvider;
pub use remote::{BuildKey, EncodedLoopback, MessageSink, UploadRegistry, WireMessage};
pub use schema::{ColumnRole, ColumnSpec, MatrixLayout};
pub use segmented::SegmentedArray;
pub use store::BackingStore;
