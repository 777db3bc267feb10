// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Byte accounting for backing buffers.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::*;

use crate::errors::{MatrixError, Result};

/// Shared byte budget for matrix buffers.
///
/// Every segment allocation takes out a [Lease] on the budget, and the lease
/// is returned when the segment is dropped. A budget with a limit refuses
/// leases that would push usage over it.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: Option<usize>,
    in_use: AtomicUsize,
}

/// Bytes held against a [MemoryBudget] until dropped.
#[derive(Debug)]
pub(crate) struct Lease {
    budget: Arc<MemoryBudget>,
    bytes: usize,
}

impl MemoryBudget {
    /// Create a budget with no limit.
    pub fn unbounded() -> Arc<Self> {
        Arc::new(MemoryBudget {
            limit: None,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Create a budget that refuses allocations beyond `bytes`.
    pub fn with_limit(bytes: usize) -> Arc<Self> {
        Arc::new(MemoryBudget {
            limit: Some(bytes),
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Get the number of bytes currently leased.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(self: &Arc<Self>, bytes: usize) -> Result<Lease> {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(bytes).filter(|n| *n <= limit)
            })
            .map_err(|cur| {
                warn!(
                    "refusing lease of {} bytes ({} in use, limit {})",
                    bytes, cur, limit
                );
                MatrixError::Allocation {
                    requested: bytes,
                    reason: format!("memory budget exceeded ({} of {} bytes in use)", cur, limit),
                }
            })?;
        Ok(Lease {
            budget: self.clone(),
            bytes,
        })
    }
}

impl Lease {
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
