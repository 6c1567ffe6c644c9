//! File manifests: the content-addressed description of a shared file.
//!
//! A manifest is a pure function of the file bytes and the chunk size.
//! Sharing the same bytes twice with the same chunk size yields the same
//! manifest, and therefore the same `content_hash`.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::hex32;
use crate::wire::MAX_CHUNK_SIZE;

/// Upper bound on chunk count, keeping a JSON manifest inside one frame.
pub const MAX_MANIFEST_CHUNKS: usize = 24_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileManifest {
    /// BLAKE3 of the whole file.
    #[serde(with = "hex32")]
    pub content_hash: [u8; 32],
    pub total_size: u64,
    pub chunk_size: u32,
    /// BLAKE3 of each chunk, in file order.
    #[serde(with = "hex32::vec")]
    pub chunk_hashes: Vec<[u8; 32]>,
}

impl FileManifest {
    /// Chunk and hash `data`.
    pub fn from_bytes(data: &[u8], chunk_size: u32) -> Result<Self, ManifestError> {
        check_chunk_size(chunk_size)?;
        let chunk_hashes: Vec<[u8; 32]> = data
            .chunks(chunk_size as usize)
            .map(|c| *blake3::hash(c).as_bytes())
            .collect();
        if chunk_hashes.len() > MAX_MANIFEST_CHUNKS {
            return Err(ManifestError::TooManyChunks(chunk_hashes.len()));
        }
        Ok(Self {
            content_hash: *blake3::hash(data).as_bytes(),
            total_size: data.len() as u64,
            chunk_size,
            chunk_hashes,
        })
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    /// Byte range of chunk `index` within the file.
    pub fn chunk_range(&self, index: u32) -> Option<Range<u64>> {
        if index >= self.chunk_count() {
            return None;
        }
        let start = index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.total_size);
        Some(start..end)
    }

    pub fn chunk_len(&self, index: u32) -> Option<usize> {
        self.chunk_range(index).map(|r| (r.end - r.start) as usize)
    }

    /// True iff `data` is exactly chunk `index`.
    pub fn verify_chunk(&self, index: u32, data: &[u8]) -> bool {
        match (self.chunk_hashes.get(index as usize), self.chunk_len(index)) {
            (Some(expected), Some(len)) => {
                data.len() == len && blake3::hash(data).as_bytes() == expected
            }
            _ => false,
        }
    }

    /// True iff `data` is the whole file this manifest describes.
    pub fn verify_file(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.total_size && blake3::hash(data).as_bytes() == &self.content_hash
    }

    /// Structural checks for a manifest received from a peer.
    pub fn validate(&self) -> Result<(), ManifestError> {
        check_chunk_size(self.chunk_size)?;
        let expected = self.total_size.div_ceil(self.chunk_size as u64);
        if expected != self.chunk_hashes.len() as u64 {
            return Err(ManifestError::ChunkCountMismatch {
                expected,
                actual: self.chunk_hashes.len(),
            });
        }
        if self.chunk_hashes.len() > MAX_MANIFEST_CHUNKS {
            return Err(ManifestError::TooManyChunks(self.chunk_hashes.len()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        serde_json::to_vec(self).map_err(ManifestError::Json)
    }

    /// Parse and validate a FILE_MANIFEST payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_slice(payload).map_err(ManifestError::Json)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

fn check_chunk_size(chunk_size: u32) -> Result<(), ManifestError> {
    if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_SIZE {
        return Err(ManifestError::BadChunkSize(chunk_size));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("chunk size {0} outside 1..=1 MiB")]
    BadChunkSize(u32),

    #[error("manifest lists {actual} chunks, size implies {expected}")]
    ChunkCountMismatch { expected: u64, actual: usize },

    #[error("manifest has {0} chunks, above the limit")]
    TooManyChunks(usize),

    #[error("manifest JSON: {0}")]
    Json(#[source] serde_json::Error),
}
