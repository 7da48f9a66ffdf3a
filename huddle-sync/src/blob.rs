//! Content-addressed blob store interface.
//!
//! The document only ever holds content ids; the bytes live in a blob store
//! reached through [`BlobStore`].

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

/// Store bytes under a content id, fetch them back by id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return their content id. `name` is a hint for
    /// stores that keep it; the id depends on the bytes only.
    async fn store(&self, bytes: Vec<u8>, name: &str) -> Result<String, BlobError>;

    async fn fetch(&self, cid: &str) -> Result<Vec<u8>, BlobError>;
}

/// In-memory [`BlobStore`] keyed by a FNV-1a digest of the content.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name the blob was first stored under.
    pub fn name_of(&self, cid: &str) -> Option<String> {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .map(|(name, _)| name.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(&self, bytes: Vec<u8>, name: &str) -> Result<String, BlobError> {
        let cid = content_id(&bytes);
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.entry(cid.clone()).or_insert_with(|| (name.to_string(), bytes));
        Ok(cid)
    }

    async fn fetch(&self, cid: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| BlobError::NotFound(cid.to_string()))
    }
}

/// Content id for `bytes`: `fnv1a-` followed by the 64-bit digest in hex.
pub fn content_id(bytes: &[u8]) -> String {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let digest = bytes
        .iter()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME));
    format!("fnv1a-{digest:016x}")
}

/// Blob store errors.
#[derive(Debug, Clone, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}
