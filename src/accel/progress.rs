// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

use std::sync::RwLock;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use log::*;

const UPDATE_SECS: f64 = 0.2;

#[derive(Clone, Copy)]
struct UpdateState {
    count: usize,
    time: f64,
    rate: f64,
}

/// Throttled progress logger for a parallel pass.
///
/// Chunk tasks tick the handle as they finish; a log line is emitted at most
/// every [UPDATE_SECS] seconds.
pub(crate) struct ProgressHandle {
    label: &'static str,
    total: usize,
    start: Instant,
    count: AtomicUsize,
    last_update: RwLock<Option<UpdateState>>,
}

impl ProgressHandle {
    pub fn new(label: &'static str, total: usize) -> Self {
        ProgressHandle {
            label,
            total,
            count: AtomicUsize::new(0),
            start: Instant::now(),
            last_update: RwLock::new(None),
        }
    }

    pub fn tick(&self) {
        self.advance(1);
    }

    pub fn advance(&self, n: usize) {
        let count = self.count.fetch_add(n, Ordering::Relaxed) + n;

        let last_update = {
            let lock = self.last_update.read().expect("poisoned lock");
            *lock
        };

        let thresh = if let Some(lu) = last_update {
            // skip the clock if the rate says we are not due yet
            let n = (count - lu.count) as f64;
            if n / lu.rate < UPDATE_SECS * 0.95 {
                return;
            }

            lu.time
        } else {
            0.0
        };

        let time = self.start.elapsed().as_secs_f64();
        if time < thresh + UPDATE_SECS {
            return;
        }

        // another ticker holding the lock is already reporting
        if let Ok(mut lock) = self.last_update.try_write() {
            *lock = Some(UpdateState {
                count,
                time,
                rate: count as f64 / time,
            });
            self.refresh(count, time);
        }
    }

    /// Get the number of completed units.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Log the final count for the pass.
    pub fn finish(&self) {
        debug!(
            "{}: {} of {} chunks in {:.3}s",
            self.label,
            self.count(),
            self.total,
            self.start.elapsed().as_secs_f64()
        );
    }

    fn refresh(&self, count: usize, time: f64) {
        info!(
            "{}: {}/{} chunks ({:.1}s)",
            self.label, count, self.total, time
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_ticks() {
        let pb = ProgressHandle::new("test", 5);
        for _ in 0..5 {
            pb.tick();
        }
        pb.advance(2);
        assert_eq!(pb.count(), 7);
        pb.finish();
    }
}
