//! Runtime patch pipeline
//!
//! The write path for self-modification: an agent worker, while its own
//! task is still in flight, submits a JSON Patch against its run. The
//! pipeline validates (three layers, including a speculative
//! materialization of the run's current chain), persists (CAS blob +
//! `patch_set` artifact + `run_patch` row under the per-run sequence lock),
//! rematerializes the full chain, compiles, and atomically installs the new
//! IR. The agent's own completion signal then routes against the new
//! topology.
//!
//! A rejected patch persists nothing. Concurrent patches for one run
//! serialize on the sequence lock; the `(run_id, seq)` uniqueness
//! constraint is the cross-process backstop.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use super::Services;
use crate::ast::PatchOp;
use crate::error::CoreError;
use crate::ir::Ir;
use crate::materializer;
use crate::store::{
    media_type, Artifact, ArtifactCatalog, ArtifactSpec, Cas, HotStore, RunPatch, RunRecord,
    RunStore, StoreError,
};
use crate::types::{ArtifactId, RunId};
use crate::validator;

/// A patch submitted by an agent mid-run
#[derive(Debug, Clone)]
pub struct PatchSubmission {
    pub run_id: RunId,
    /// The agent node that produced the patch
    pub node_id: String,
    pub operations: Vec<PatchOp>,
    pub description: String,
    pub actor: String,
}

/// Acknowledgment returned to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReceipt {
    pub patch_id: ArtifactId,
    pub seq: u64,
    pub depth: u32,
}

/// The run's current chain, fully resolved
pub(crate) struct RunChain {
    /// Materialized document at the current chain head
    pub doc: Value,
    /// Artifact a new patch would chain onto
    pub head: Artifact,
    /// Every patch artifact id in order (pre-run chain, then run patches)
    pub patch_ids: Vec<ArtifactId>,
}

/// Resolve and materialize a run's current document from durable state
///
/// Start-of-run and mid-run rematerialization share this path, which is
/// what makes a patch install identical to a fresh materialization.
pub(crate) async fn materialize_run_doc(
    services: &Services,
    record: &RunRecord,
) -> Result<RunChain, CoreError> {
    let chain = services.catalog.patch_chain(record.base_artifact).await?;
    let run_patches = services.runs.patches(record.id).await?;

    let base_blob = services.cas.get(&chain.base.cas_id).await?;
    let mut patch_blobs = Vec::with_capacity(chain.patches.len() + run_patches.len());
    let mut patch_ids = Vec::with_capacity(chain.patches.len() + run_patches.len());

    for artifact in &chain.patches {
        let blob = services.cas.get(&artifact.cas_id).await?;
        patch_blobs.push((u64::from(artifact.depth()), blob.bytes.to_vec()));
        patch_ids.push(artifact.id);
    }

    let mut head = chain.head().clone();
    for patch in &run_patches {
        let artifact = services.catalog.get(patch.artifact_id).await?;
        let blob = services.cas.get(&artifact.cas_id).await?;
        patch_blobs.push((patch.seq, blob.bytes.to_vec()));
        patch_ids.push(artifact.id);
        head = artifact;
    }

    let doc = materializer::materialize_bytes(&base_blob.bytes, &patch_blobs)?;
    Ok(RunChain {
        doc,
        head,
        patch_ids,
    })
}

/// Accepts, validates, persists and installs runtime patches
pub struct PatchPipeline {
    services: Arc<Services>,
    /// Per-run serialization of seq allocation
    seq_locks: DashMap<RunId, Arc<Mutex<()>>>,
}

impl PatchPipeline {
    pub fn new(services: Arc<Services>) -> Self {
        PatchPipeline {
            services,
            seq_locks: DashMap::new(),
        }
    }

    fn seq_lock(&self, run_id: RunId) -> Arc<Mutex<()>> {
        self.seq_locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Submit a patch: validate, persist, rematerialize, install
    pub async fn submit(&self, submission: PatchSubmission) -> Result<PatchReceipt, CoreError> {
        let services = &self.services;
        let run_id = submission.run_id;

        let record = services.runs.get(run_id).await?;
        if record.status.is_terminal() {
            return Err(CoreError::Cancelled { run_id });
        }

        let lock = self.seq_lock(run_id);
        let _guard = lock.lock().await;

        // speculative pass against the chain as of this seq
        let chain = materialize_run_doc(services, &record).await?;
        let seq = services.runs.max_seq(run_id).await? + 1;
        let validated = validator::validate(
            &submission.operations,
            &chain.doc,
            seq,
            services.config.limits.max_agent_adds_per_patch,
        )
        .map_err(CoreError::PatchValidation)?;

        // persist: ops blob, patch_set artifact, run_patch row
        let ops_bytes = PatchOp::ops_to_bytes(&submission.operations);
        let cas_id = services
            .cas
            .put(Bytes::from(ops_bytes), media_type::PATCH_OPS)
            .await?;
        let depth = chain.head.depth() + 1;
        let artifact = Artifact::new(
            cas_id,
            ArtifactSpec::PatchSet {
                base_version: chain.head.id,
                depth,
                op_count: submission.operations.len(),
            },
        );
        let patch_id = artifact.id;
        services.catalog.insert(artifact).await?;
        services
            .runs
            .insert_patch(RunPatch {
                run_id,
                seq,
                artifact_id: patch_id,
                node_id: submission.node_id.clone(),
                description: submission.description.clone(),
                created_by: submission.actor.clone(),
                created_at: chrono::Utc::now(),
            })
            .await?;

        // install: one atomic hot-cache write; the next load by any
        // coordinator sees the patched topology
        self.install(run_id, &validated.ir).await?;
        services.hot.bump_patch_guard(run_id).await?;

        info!(
            run = %run_id,
            seq,
            depth,
            ops = submission.operations.len(),
            by = %submission.node_id,
            "runtime patch installed"
        );
        Ok(PatchReceipt {
            patch_id,
            seq,
            depth,
        })
    }

    async fn install(&self, run_id: RunId, ir: &Ir) -> Result<(), StoreError> {
        self.services
            .hot
            .install_ir(run_id, Bytes::from(ir.to_bytes()))
            .await
    }

    /// Rebuild and install a run's IR from durable state (coordinator
    /// recovery path when the hot cache is cold)
    pub async fn recover_ir(&self, run_id: RunId) -> Result<Ir, CoreError> {
        let record = self.services.runs.get(run_id).await?;
        let chain = materialize_run_doc(&self.services, &record).await?;
        let ir = crate::compiler::compile_value(&chain.doc)?;
        self.install(run_id, &ir).await?;
        Ok(ir)
    }
}

// integration coverage lives in tests/patch_pipeline_tests.rs; the unit
// tests here pin the chain resolution order
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::store::RunBaseKind;
    use crate::types::Username;
    use serde_json::json;

    async fn seed_run(services: &Arc<Services>) -> RunRecord {
        let doc = json!({
            "nodes": [
                {"id": "agent_1", "type": "agent"},
                {"id": "end", "type": "function"}
            ],
            "edges": [{"from": "agent_1", "to": "end"}]
        });
        let bytes = serde_json::to_vec(&doc).unwrap();
        let cas_id = services
            .cas
            .put(Bytes::from(bytes), media_type::WORKFLOW)
            .await
            .unwrap();
        let artifact = Artifact::new(
            cas_id,
            ArtifactSpec::DagVersion {
                version_hash: "vh".to_string(),
                nodes_count: 2,
                edges_count: 1,
            },
        );
        let base_id = artifact.id;
        services.catalog.insert(artifact).await.unwrap();

        let mut record = RunRecord::new(
            Username::new("alice").unwrap(),
            RunBaseKind::DagVersion,
            base_id.to_string(),
            base_id,
            Value::Null,
        );
        record.status = crate::ir::RunStatus::Running;
        services.runs.insert(record.clone()).await.unwrap();
        record
    }

    #[tokio::test]
    async fn sequential_patches_chain_depth_and_seq() {
        let services = Services::in_memory(CoreConfig::default());
        let pipeline = PatchPipeline::new(Arc::clone(&services));
        let record = seed_run(&services).await;

        let first = pipeline
            .submit(PatchSubmission {
                run_id: record.id,
                node_id: "agent_1".to_string(),
                operations: vec![
                    PatchOp::add("/nodes/-", json!({"id": "http_1", "type": "http"})),
                    PatchOp::add("/edges/-", json!({"from": "agent_1", "to": "http_1"})),
                    PatchOp::add("/edges/-", json!({"from": "http_1", "to": "end"})),
                ],
                description: "add fetch step".to_string(),
                actor: "agent_1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.depth, 1);

        let second = pipeline
            .submit(PatchSubmission {
                run_id: record.id,
                node_id: "agent_1".to_string(),
                operations: vec![
                    PatchOp::add("/nodes/-", json!({"id": "http_2", "type": "http"})),
                    PatchOp::add("/edges/-", json!({"from": "http_1", "to": "http_2"})),
                    PatchOp::add("/edges/-", json!({"from": "http_2", "to": "end"})),
                ],
                description: "add second fetch".to_string(),
                actor: "agent_1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.depth, 2);

        // the second patch chains onto the first
        let artifact = services.catalog.get(second.patch_id).await.unwrap();
        match artifact.spec {
            ArtifactSpec::PatchSet { base_version, .. } => {
                assert_eq!(base_version, first.patch_id)
            }
            other => panic!("unexpected spec: {other:?}"),
        }

        // the run doc reflects both patches
        let chain = materialize_run_doc(&services, &record).await.unwrap();
        assert_eq!(chain.doc["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(chain.patch_ids, vec![first.patch_id, second.patch_id]);
    }

    #[tokio::test]
    async fn rejected_patch_persists_nothing() {
        let services = Services::in_memory(CoreConfig::default());
        let pipeline = PatchPipeline::new(Arc::clone(&services));
        let record = seed_run(&services).await;

        let err = pipeline
            .submit(PatchSubmission {
                run_id: record.id,
                node_id: "agent_1".to_string(),
                operations: vec![PatchOp::add(
                    "/nodes/-",
                    json!({"id": "lonely", "type": "http"}),
                )],
                description: "orphan".to_string(),
                actor: "agent_1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PatchValidation(_)));

        assert_eq!(services.runs.max_seq(record.id).await.unwrap(), 0);
        assert!(services.runs.patches(record.id).await.unwrap().is_empty());
        assert!(services.hot.load_ir(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_ir_rebuilds_from_durable_state() {
        let services = Services::in_memory(CoreConfig::default());
        let pipeline = PatchPipeline::new(Arc::clone(&services));
        let record = seed_run(&services).await;

        pipeline
            .submit(PatchSubmission {
                run_id: record.id,
                node_id: "agent_1".to_string(),
                operations: vec![
                    PatchOp::add("/nodes/-", json!({"id": "http_1", "type": "http"})),
                    PatchOp::add("/edges/-", json!({"from": "agent_1", "to": "http_1"})),
                    PatchOp::add("/edges/-", json!({"from": "http_1", "to": "end"})),
                ],
                description: "extend".to_string(),
                actor: "agent_1".to_string(),
            })
            .await
            .unwrap();

        // simulate hot cache loss
        services.hot.drop_run(record.id).await.unwrap();
        let ir = pipeline.recover_ir(record.id).await.unwrap();
        assert!(ir.node("http_1").is_some());
        assert!(services.hot.load_ir(record.id).await.unwrap().is_some());
    }
}
