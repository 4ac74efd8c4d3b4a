//! Cold run records and the append-only run-patch log
//!
//! The run record is the durable side of a run: who submitted it, what it
//! was based on, the tag positions at submission, and its projected status.
//! Run patches are append-only rows with a per-run strictly monotonic `seq`
//! enforced by the `(run_id, seq)` uniqueness constraint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;
use crate::ir::RunStatus;
use crate::types::{ArtifactId, RunId, Username};

/// What a run submission referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunBaseKind {
    Tag,
    DagVersion,
    PatchSet,
}

/// Durable run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub username: Username,
    pub base_kind: RunBaseKind,
    pub base_ref: String,
    /// Chain head artifact (dag_version or patch_set) the base resolved to
    /// at submission; rematerialization starts here
    pub base_artifact: ArtifactId,
    /// Tag positions observed at submission
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub tag_snapshot: Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        username: Username,
        base_kind: RunBaseKind,
        base_ref: impl Into<String>,
        base_artifact: ArtifactId,
        tag_snapshot: Value,
    ) -> Self {
        let now = Utc::now();
        RunRecord {
            id: RunId::generate(),
            username,
            base_kind,
            base_ref: base_ref.into(),
            base_artifact,
            tag_snapshot,
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One applied runtime patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPatch {
    pub run_id: RunId,
    /// Strictly monotonic per run, starting at 1
    pub seq: u64,
    pub artifact_id: ArtifactId,
    /// The agent node that produced the patch
    pub node_id: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Durable run store
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, record: RunRecord) -> Result<(), StoreError>;

    async fn get(&self, id: RunId) -> Result<RunRecord, StoreError>;

    /// Apply a status update; regressions (per [`RunStatus::rank`]) are
    /// dropped. Returns whether the record changed.
    async fn update_status(&self, id: RunId, status: RunStatus) -> Result<bool, StoreError>;

    /// Append a run patch; a duplicate `(run_id, seq)` is a conflict
    async fn insert_patch(&self, patch: RunPatch) -> Result<(), StoreError>;

    /// All patches for a run in ascending seq order
    async fn patches(&self, run_id: RunId) -> Result<Vec<RunPatch>, StoreError>;

    /// Highest applied seq for a run (0 when unpatched)
    async fn max_seq(&self, run_id: RunId) -> Result<u64, StoreError>;
}

/// In-memory reference implementation
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    records: DashMap<RunId, RunRecord>,
    patches: Mutex<Vec<RunPatch>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, record: RunRecord) -> Result<(), StoreError> {
        match self.records.entry(record.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::conflict(format!(
                "run {} already exists",
                record.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, id: RunId) -> Result<RunRecord, StoreError> {
        self.records
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found("run", id))
    }

    async fn update_status(&self, id: RunId, status: RunStatus) -> Result<bool, StoreError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("run", id))?;

        // terminal states never change, and rank regressions are dropped
        if record.status.is_terminal() || status.rank() < record.status.rank() {
            return Ok(false);
        }
        if record.status == status {
            return Ok(false);
        }
        record.status = status;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_patch(&self, patch: RunPatch) -> Result<(), StoreError> {
        let mut patches = self.patches.lock();
        if patches
            .iter()
            .any(|p| p.run_id == patch.run_id && p.seq == patch.seq)
        {
            return Err(StoreError::conflict(format!(
                "run patch ({}, {}) already exists",
                patch.run_id, patch.seq
            )));
        }
        patches.push(patch);
        Ok(())
    }

    async fn patches(&self, run_id: RunId) -> Result<Vec<RunPatch>, StoreError> {
        let mut rows: Vec<RunPatch> = self
            .patches
            .lock()
            .iter()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.seq);
        Ok(rows)
    }

    async fn max_seq(&self, run_id: RunId) -> Result<u64, StoreError> {
        Ok(self
            .patches
            .lock()
            .iter()
            .filter(|p| p.run_id == run_id)
            .map(|p| p.seq)
            .max()
            .unwrap_or(0))
    }
}
