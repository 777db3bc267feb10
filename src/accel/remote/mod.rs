// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Cross-process matrix builds.
//!
//! The producer plans and fills chunks locally, then ships each chunk's
//! contribution as a patch. The consumer's [UploadRegistry] applies the
//! patches at the same offsets a local build would use and finishes the
//! build into a [MatrixProvider](crate::provider::MatrixProvider).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::Result;

mod messages;
mod registry;
mod upload;

pub use messages::{BuildKey, WireMessage};
pub use registry::UploadRegistry;
pub(crate) use upload::upload;

/// Destination for wire messages.
///
/// Producers send chunk patches from many threads at once.
pub trait MessageSink: Sync {
    fn send(&self, msg: WireMessage) -> Result<()>;
}

/// Sink that pushes every message through the binary codec before applying
/// it to a registry.
pub struct EncodedLoopback<'a> {
    registry: &'a UploadRegistry,
    bytes: AtomicUsize,
    messages: AtomicUsize,
}

impl<'a> EncodedLoopback<'a> {
    pub fn new(registry: &'a UploadRegistry) -> Self {
        EncodedLoopback {
            registry,
            bytes: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
        }
    }

    /// Get the total encoded size of the messages sent.
    pub fn bytes_sent(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> usize {
        self.messages.load(Ordering::Relaxed)
    }
}

impl MessageSink for EncodedLoopback<'_> {
    fn send(&self, msg: WireMessage) -> Result<()> {
        let bytes = msg.encode()?;
        self.bytes.fetch_add(bytes.len(), Ordering::Relaxed);
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.registry.apply_bytes(&bytes)
    }
}
