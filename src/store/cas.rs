//! Content-addressed store
//!
//! Opaque byte blobs keyed by the SHA-256 of their contents. `put` is
//! deterministic (identical bytes yield identical ids) and deduplicating;
//! `get` never returns partial data. The trait is async because production
//! backings are remote object stores; the in-memory reference keeps whole
//! blobs in a DashMap.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::StoreError;
use crate::types::CasId;

/// Well-known media types for core payloads
pub mod media_type {
    pub const WORKFLOW: &str = "application/vnd.workflow+json";
    pub const PATCH_OPS: &str = "application/vnd.patch-ops+json";
    pub const IR: &str = "application/vnd.workflow-ir+json";
    pub const NODE_OUTPUT: &str = "application/vnd.node-output+json";
}

/// A stored blob with its declared media type
#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Bytes,
    pub media_type: String,
}

/// Content-addressed blob store
#[async_trait]
pub trait Cas: Send + Sync {
    /// Store a payload; identical bytes always yield the same id
    async fn put(&self, bytes: Bytes, media_type: &str) -> Result<CasId, StoreError>;

    /// Fetch a blob by content id
    async fn get(&self, id: &CasId) -> Result<Blob, StoreError>;

    /// Cheap existence probe
    async fn exists(&self, id: &CasId) -> Result<bool, StoreError>;
}

/// In-memory reference implementation
#[derive(Debug, Default)]
pub struct MemoryCas {
    blobs: DashMap<CasId, Arc<Blob>>,
}

impl MemoryCas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held (duplicates collapse)
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl Cas for MemoryCas {
    async fn put(&self, bytes: Bytes, media_type: &str) -> Result<CasId, StoreError> {
        let id = CasId::digest(&bytes);
        self.blobs.entry(id.clone()).or_insert_with(|| {
            Arc::new(Blob {
                bytes,
                media_type: media_type.to_string(),
            })
        });
        Ok(id)
    }

    async fn get(&self, id: &CasId) -> Result<Blob, StoreError> {
        self.blobs
            .get(id)
            .map(|b| (**b).clone())
            .ok_or_else(|| StoreError::not_found("blob", id))
    }

    async fn exists(&self, id: &CasId) -> Result<bool, StoreError> {
        Ok(self.blobs.contains_key(id))
    }
}

/// Store a JSON value as a blob
pub async fn put_json(
    cas: &dyn Cas,
    value: &serde_json::Value,
    media_type: &str,
) -> Result<CasId, StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
        detail: format!("unserializable payload: {}", e),
    })?;
    cas.put(Bytes::from(bytes), media_type).await
}

/// Fetch and parse a JSON blob
pub async fn get_json(cas: &dyn Cas, id: &CasId) -> Result<serde_json::Value, StoreError> {
    let blob = cas.get(id).await?;
    serde_json::from_slice(&blob.bytes).map_err(|e| StoreError::Corrupt {
        detail: format!("blob {} is not valid JSON: {}", id, e),
    })
}
