//! Run submission
//!
//! Resolves a base reference (tag, dag_version or patch_set), materializes
//! and compiles it, records the run, installs the IR into the hot cache and
//! seeds the root tokens. Admission runs through the rate limiter before
//! any state is created; every pre-admission step is a pure read.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::info;

use super::{emit_to, pipeline, Services};
use crate::ast::WorkflowDoc;
use crate::error::CoreError;
use crate::ir::{Ir, RunStatus, StatusUpdate};
use crate::limits::RateLimiter;
use crate::materializer;
use crate::store::{
    media_type, Artifact, ArtifactCatalog, ArtifactKind, ArtifactSpec, Cas, HotStore,
    PatchGuard, RunBaseKind, RunRecord, RunStore, StoreError, TagRegistry,
};
use crate::types::{ArtifactId, RunId, TagName, Username};

/// What a submission points at
#[derive(Debug, Clone)]
pub enum BaseRef {
    /// The submitting user's tag
    Tag { name: TagName },
    DagVersion(ArtifactId),
    PatchSet(ArtifactId),
}

/// One run submission
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub username: Username,
    pub base: BaseRef,
}

/// Admits and starts runs
pub struct Submitter {
    services: Arc<Services>,
    limiter: RateLimiter,
}

impl Submitter {
    pub fn new(services: Arc<Services>) -> Self {
        let limiter = RateLimiter::new(
            Arc::clone(&services.hot),
            services.config.rate.clone(),
        );
        Submitter { services, limiter }
    }

    /// Submit a run; returns its id once the roots are seeded
    pub async fn submit(&self, request: SubmitRequest) -> Result<RunId, CoreError> {
        let services = &self.services;

        // resolve the base to a chain head artifact, snapshotting tag
        // position when a tag was referenced
        let (base_kind, base_ref, head_id, tag_snapshot, limiter_tag) = match &request.base {
            BaseRef::Tag { name } => {
                let tag = services.tags.get(&request.username, name).await?;
                let snapshot = json!({
                    "name": name.as_str(),
                    "target_kind": tag.target_kind,
                    "target_id": tag.target_id,
                    "version": tag.version,
                });
                (
                    RunBaseKind::Tag,
                    format!("{}/{}", request.username, name),
                    tag.target_id,
                    snapshot,
                    name.as_str().to_string(),
                )
            }
            BaseRef::DagVersion(id) => {
                let artifact = services.catalog.get(*id).await?;
                if artifact.kind() != ArtifactKind::DagVersion {
                    return Err(StoreError::conflict(format!(
                        "artifact {} is a {}, not a dag_version",
                        id,
                        artifact.kind()
                    ))
                    .into());
                }
                (
                    RunBaseKind::DagVersion,
                    id.to_string(),
                    *id,
                    Value::Null,
                    id.to_string(),
                )
            }
            BaseRef::PatchSet(id) => {
                let artifact = services.catalog.get(*id).await?;
                if artifact.kind() != ArtifactKind::PatchSet {
                    return Err(StoreError::conflict(format!(
                        "artifact {} is a {}, not a patch_set",
                        id,
                        artifact.kind()
                    ))
                    .into());
                }
                (
                    RunBaseKind::PatchSet,
                    id.to_string(),
                    *id,
                    Value::Null,
                    id.to_string(),
                )
            }
        };

        // materialize and compile (reads only, nothing persisted yet)
        let chain = services.catalog.patch_chain(head_id).await?;
        let base_blob = services.cas.get(&chain.base.cas_id).await?;
        let mut patch_blobs = Vec::with_capacity(chain.patches.len());
        let mut patch_ids = Vec::with_capacity(chain.patches.len());
        for artifact in &chain.patches {
            let blob = services.cas.get(&artifact.cas_id).await?;
            patch_blobs.push((u64::from(artifact.depth()), blob.bytes.to_vec()));
            patch_ids.push(artifact.id);
        }
        let doc = materializer::materialize_bytes(&base_blob.bytes, &patch_blobs)?;
        let parsed = WorkflowDoc::from_value(&doc)?;
        let ir = crate::compiler::compile(&parsed)?;

        // admission: all three gates, before any write
        self.limiter
            .admit(&request.username, &limiter_tag, parsed.agent_node_count())
            .await?;

        // dedupe the materialized IR by plan hash
        let plan_hash = materializer::plan_hash(chain.base.id, &patch_ids);
        let ir_bytes = Bytes::from(ir.to_bytes());
        if services
            .catalog
            .snapshot_by_plan_hash(&plan_hash)
            .await?
            .is_none()
        {
            let ir_cas = services
                .cas
                .put(ir_bytes.clone(), media_type::IR)
                .await?;
            services
                .catalog
                .insert(Artifact::new(
                    ir_cas,
                    ArtifactSpec::RunSnapshot {
                        plan_hash: plan_hash.clone(),
                        version_hash: materializer::version_hash(&doc),
                    },
                ))
                .await?;
        }

        // durable record first, then hot state
        let record = RunRecord::new(
            request.username.clone(),
            base_kind,
            base_ref,
            head_id,
            tag_snapshot,
        );
        let run_id = record.id;
        services.runs.insert(record).await?;
        services
            .bus
            .publish_status(StatusUpdate::now(run_id, RunStatus::Queued));

        services.hot.install_ir(run_id, ir_bytes).await?;
        services
            .hot
            .set_patch_guard(
                run_id,
                PatchGuard {
                    base_agent_nodes: ir.agent_node_count(),
                    applied_patches: 0,
                },
            )
            .await?;
        services.hot.set_status(run_id, RunStatus::Running).await?;
        services
            .bus
            .publish_status(StatusUpdate::now(run_id, RunStatus::Running));

        self.seed_roots(run_id, &ir).await?;
        info!(run = %run_id, nodes = ir.nodes.len(), plan = %plan_hash, "run started");
        Ok(run_id)
    }

    /// Emit the start tokens for every zero-dependency node
    async fn seed_roots(&self, run_id: RunId, ir: &Ir) -> Result<(), CoreError> {
        let empty = json!({});
        for root in ir.root_nodes() {
            emit_to(
                &self.services,
                run_id,
                None,
                root,
                "start",
                0,
                &empty,
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Cancel a run: terminal status out, hot state dropped; in-flight
    /// signals drain without routing
    pub async fn cancel(&self, run_id: RunId) -> Result<(), CoreError> {
        let services = &self.services;
        // make sure the run exists before declaring anything
        let _ = services.runs.get(run_id).await?;
        services.hot.set_status(run_id, RunStatus::Cancelled).await?;
        services
            .bus
            .publish_status(StatusUpdate::now(run_id, RunStatus::Cancelled));
        services.hot.drop_run(run_id).await?;
        info!(run = %run_id, "run cancelled");
        Ok(())
    }

    /// Rebuild a run's IR from durable state (operator escape hatch)
    pub async fn rematerialize(&self, run_id: RunId) -> Result<Ir, CoreError> {
        let record = self.services.runs.get(run_id).await?;
        let chain = pipeline::materialize_run_doc(&self.services, &record).await?;
        let ir = crate::compiler::compile_value(&chain.doc)?;
        self.services
            .hot
            .install_ir(run_id, Bytes::from(ir.to_bytes()))
            .await?;
        Ok(ir)
    }
}
