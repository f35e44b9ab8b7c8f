//! Reassembly of module binaries uploaded in chunks

use crate::error::{AgentError, Result};
use bytes::Bytes;
use outpost_proto::ModuleManifest;
use std::collections::HashMap;
use tracing::warn;

/// Upper bound on the declared chunk count of one bundle
pub const MAX_BUNDLE_CHUNKS: usize = 10_000;

/// A module upload in progress
#[derive(Debug)]
pub struct PendingBundle {
    manifest: ModuleManifest,
    total_size: usize,
    total_chunks: usize,
    chunks: HashMap<usize, Bytes>,
    received_bytes: usize,
}

impl PendingBundle {
    /// Validate upload parameters and open an empty bundle
    pub fn new(manifest: ModuleManifest, total_size: i64, total_chunks: i64) -> Result<Self> {
        if manifest.id.is_empty() {
            return Err(AgentError::InvalidBundle("manifest id is required".to_string()));
        }
        let total_chunks = usize::try_from(total_chunks)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| AgentError::InvalidBundle(format!("invalid chunk count {}", total_chunks)))?;
        let total_size = usize::try_from(total_size)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| AgentError::InvalidBundle(format!("invalid bundle size {}", total_size)))?;
        if total_chunks > MAX_BUNDLE_CHUNKS {
            return Err(AgentError::InvalidBundle(format!(
                "too many chunks: {} (max {})",
                total_chunks, MAX_BUNDLE_CHUNKS
            )));
        }

        Ok(Self {
            manifest,
            total_size,
            total_chunks,
            chunks: HashMap::new(),
            received_bytes: 0,
        })
    }

    /// Store a chunk; the first copy of an index wins
    ///
    /// Returns whether the chunk was new.
    pub fn add_chunk(&mut self, index: i64, data: Bytes) -> Result<bool> {
        let index = usize::try_from(index).map_err(|_| AgentError::InvalidChunk(index))?;
        if self.chunks.contains_key(&index) {
            return Ok(false);
        }
        self.received_bytes += data.len();
        self.chunks.insert(index, data);
        Ok(true)
    }

    /// Concatenate chunks `0..total_chunks` in index order
    pub fn assemble(&self) -> Result<Vec<u8>> {
        if self.chunks.len() < self.total_chunks {
            return Err(AgentError::BundleIncomplete {
                received: self.chunks.len(),
                total: self.total_chunks,
            });
        }

        let mut binary = Vec::with_capacity(self.total_size);
        for index in 0..self.total_chunks {
            let chunk = self.chunks.get(&index).ok_or(AgentError::MissingChunk(index))?;
            binary.extend_from_slice(chunk);
        }

        if binary.len() != self.total_size {
            warn!(
                module = %self.manifest.id,
                declared = self.total_size,
                actual = binary.len(),
                "assembled bundle size differs from declared size"
            );
        }
        Ok(binary)
    }

    /// Manifest supplied when the upload started
    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// Number of distinct chunks received
    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Declared chunk count
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Bytes received so far, duplicates excluded
    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }
}
