//! Chunk manifest attached as metadata to an object's root key.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Reference to a single chunk blob.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    /// Key under which the chunk blob is stored.
    pub object_id: String,

    /// Position of the chunk, strictly increasing from 0.
    pub chunk_id: u32,

    /// Length of the chunk in bytes.
    pub size: u64,
}

/// Ordered list of chunk references describing how to reassemble an object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct Manifest {
    chunks: Vec<ChunkRef>,
}

impl Manifest {
    pub fn new(chunks: Vec<ChunkRef>) -> Self {
        Self { chunks }
    }

    pub fn chunks(&self) -> &[ChunkRef] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<ChunkRef> {
        self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Sum of all chunk lengths.
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Check that chunk ids run 0, 1, 2, ... with no gaps or duplicates.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunks.is_empty() {
            return Err("manifest lists no chunks".into());
        }
        for (expected, chunk) in self.chunks.iter().enumerate() {
            if chunk.chunk_id as usize != expected {
                return Err(format!(
                    "chunk id {} found at position {}",
                    chunk.chunk_id, expected
                ));
            }
        }
        Ok(())
    }
}

/// The two shapes an object can take under its root key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredObject {
    /// Small object: the root value is the whole payload.
    Inline(Bytes),
    /// Large object: the root carries a manifest and its value is unused.
    Chunked(Manifest),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u32, size: u64) -> ChunkRef {
        ChunkRef {
            object_id: format!("root/{id:06}"),
            chunk_id: id,
            size,
        }
    }

    #[test]
    fn validate_accepts_contiguous_ids() {
        let manifest = Manifest::new(vec![chunk(0, 4), chunk(1, 4), chunk(2, 1)]);
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.total_size(), 9);
    }

    #[test]
    fn validate_rejects_gaps_and_empty() {
        assert!(Manifest::new(vec![]).validate().is_err());
        let gap = Manifest::new(vec![chunk(0, 4), chunk(2, 4)]);
        assert!(gap.validate().unwrap_err().contains("chunk id 2"));
    }

    #[test]
    fn serializes_as_plain_array_with_camel_case_keys() {
        let manifest = Manifest::new(vec![chunk(0, 3)]);
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json[0]["objectId"], "root/000000");
        assert_eq!(json[0]["chunkId"], 0);
    }
}
