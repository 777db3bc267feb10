// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Thread pool setup and the per-chunk parallel map.

use log::*;

#[cfg(feature = "fuse-parallel")]
use rayon::iter::PanicFuse;
use rayon::{
    current_num_threads,
    iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator},
    ThreadPoolBuilder,
};

use crate::errors::{MatrixError, Result};

/// Initialize the global worker pool with `n_threads` threads.
pub fn init_pool(n_threads: usize) -> Result<()> {
    debug!("initializing matrix worker pool with {} threads", n_threads);
    ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build_global()
        .map_err(|e| MatrixError::Config(format!("thread pool initialization error: {}", e)))
}

pub fn thread_count() -> usize {
    current_num_threads()
}

#[cfg(not(feature = "fuse-parallel"))]
pub fn maybe_fuse<I: ParallelIterator>(iter: I) -> I {
    iter
}

#[cfg(feature = "fuse-parallel")]
pub fn maybe_fuse<I: ParallelIterator>(iter: I) -> PanicFuse<I> {
    iter.panic_fuse()
}

/// Run one task per unit in parallel and collect the results in unit order.
///
/// Each task receives its unit index. The call returns only after every
/// task has finished, so it doubles as the barrier between passes; the first
/// error (in unit order) is returned.
pub(crate) fn par_map_units<U, R, F>(units: Vec<U>, f: F) -> Result<Vec<R>>
where
    U: Send,
    R: Send,
    F: Fn(usize, U) -> Result<R> + Sync + Send,
{
    let results: Vec<Result<R>> =
        maybe_fuse(units.into_par_iter().enumerate().map(|(i, u)| f(i, u))).collect();
    results.into_iter().collect()
}
