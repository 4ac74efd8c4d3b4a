//! Store Module - durable and hot state behind async traits
//!
//! Four stores with distinct lifecycles:
//! - `cas`: immutable content-addressed blobs (documents, patches, outputs)
//! - `catalog`: typed artifact records and the patch chain walk
//! - `tags`: mutable per-user pointers with compare-and-swap moves
//! - `runs`: cold run records and the append-only run-patch log
//! - `hot`: per-run volatile state (IR cache, counters, applied sets) and
//!   the atomic counter protocol
//! - `bus`: streams and channels (task streams, completion queue, status
//!   updates)
//!
//! Every store is a trait with an in-memory reference implementation built
//! on DashMap; production backends plug in behind the same seams.

mod bus;
mod cas;
mod catalog;
mod hot;
mod runs;
mod tags;

pub use bus::{SharedReceiver, StreamBus, COMPLETION_SIGNALS, STATUS_UPDATES, TASK_STREAM_PREFIX};
pub use cas::{get_json, media_type, put_json, Blob, Cas, MemoryCas};
pub use catalog::{
    Artifact, ArtifactCatalog, ArtifactKind, ArtifactSpec, MemoryCatalog, PatchChain,
};
pub use hot::{CounterOutcome, HotStore, MemoryHotStore, PatchGuard};
pub use runs::{MemoryRunStore, RunBaseKind, RunPatch, RunRecord, RunStore};
pub use tags::{MemoryTagRegistry, Tag, TagMove, TagRegistry};

use thiserror::Error;

/// Storage failure
///
/// `Unavailable` is the transient disposition: callers retry it with
/// bounded backoff. Everything else surfaces.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("conflict: {detail}")]
    Conflict { detail: String },

    #[error("store unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("corrupt record: {detail}")]
    Corrupt { detail: String },
}

impl StoreError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        StoreError::Conflict {
            detail: detail.into(),
        }
    }

    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}
