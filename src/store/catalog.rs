//! Artifact catalog
//!
//! Typed, immutable metadata records pointing into the CAS. Three kinds:
//! `dag_version` (a base workflow document), `patch_set` (an operations
//! blob chained onto a base), `run_snapshot` (a materialized IR identity,
//! deduplicated by plan hash).
//!
//! The patch chain walk follows `base_version` links from a head back to
//! its `dag_version`. `depth` strictly increases along the chain, which is
//! what makes every walk terminate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::types::{ArtifactId, CasId};

/// Artifact kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    DagVersion,
    PatchSet,
    RunSnapshot,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactKind::DagVersion => "dag_version",
            ArtifactKind::PatchSet => "patch_set",
            ArtifactKind::RunSnapshot => "run_snapshot",
        };
        write!(f, "{}", s)
    }
}

/// Kind-specific hot columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactSpec {
    DagVersion {
        version_hash: String,
        nodes_count: usize,
        edges_count: usize,
    },
    PatchSet {
        /// Artifact this patch modifies: another patch_set or the dag_version
        base_version: ArtifactId,
        /// 1 + parent patch_set depth; 1 when based directly on a dag_version
        depth: u32,
        op_count: usize,
    },
    RunSnapshot {
        plan_hash: String,
        version_hash: String,
    },
}

impl ArtifactSpec {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactSpec::DagVersion { .. } => ArtifactKind::DagVersion,
            ArtifactSpec::PatchSet { .. } => ArtifactKind::PatchSet,
            ArtifactSpec::RunSnapshot { .. } => ArtifactKind::RunSnapshot,
        }
    }
}

/// A typed, immutable catalog record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub cas_id: CasId,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub spec: ArtifactSpec,
}

impl Artifact {
    pub fn new(cas_id: CasId, spec: ArtifactSpec) -> Self {
        Artifact {
            id: ArtifactId::generate(),
            cas_id,
            created_at: Utc::now(),
            spec,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.spec.kind()
    }

    /// Patch depth; zero for non-patch artifacts
    pub fn depth(&self) -> u32 {
        match &self.spec {
            ArtifactSpec::PatchSet { depth, .. } => *depth,
            _ => 0,
        }
    }
}

/// A resolved patch chain: the base document plus patches base -> head
#[derive(Debug, Clone)]
pub struct PatchChain {
    pub base: Artifact,
    pub patches: Vec<Artifact>,
}

impl PatchChain {
    /// The artifact a new patch would chain onto
    pub fn head(&self) -> &Artifact {
        self.patches.last().unwrap_or(&self.base)
    }
}

/// Catalog of typed artifacts
#[async_trait]
pub trait ArtifactCatalog: Send + Sync {
    /// Insert an immutable record; inserting an existing id is a conflict
    async fn insert(&self, artifact: Artifact) -> Result<(), StoreError>;

    async fn get(&self, id: ArtifactId) -> Result<Artifact, StoreError>;

    /// Find a dag_version by its content hash
    async fn dag_by_version_hash(&self, version_hash: &str)
        -> Result<Option<Artifact>, StoreError>;

    /// Find a run_snapshot by its plan hash (materialization dedup)
    async fn snapshot_by_plan_hash(&self, plan_hash: &str)
        -> Result<Option<Artifact>, StoreError>;

    /// Walk `base_version` links from a head down to its dag_version
    ///
    /// Accepts a dag_version id directly (empty patch list). A link that
    /// does not strictly decrease in depth, or a missing ancestor, surfaces
    /// as an invalid-reference conflict.
    async fn patch_chain(&self, head: ArtifactId) -> Result<PatchChain, StoreError>;
}

/// In-memory reference implementation
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    artifacts: DashMap<ArtifactId, Artifact>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactCatalog for MemoryCatalog {
    async fn insert(&self, artifact: Artifact) -> Result<(), StoreError> {
        match self.artifacts.entry(artifact.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::conflict(format!(
                "artifact {} already exists",
                artifact.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(artifact);
                Ok(())
            }
        }
    }

    async fn get(&self, id: ArtifactId) -> Result<Artifact, StoreError> {
        self.artifacts
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| StoreError::not_found("artifact", id))
    }

    async fn dag_by_version_hash(
        &self,
        version_hash: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self.artifacts.iter().find_map(|a| match &a.spec {
            ArtifactSpec::DagVersion { version_hash: h, .. } if h == version_hash => {
                Some(a.clone())
            }
            _ => None,
        }))
    }

    async fn snapshot_by_plan_hash(
        &self,
        plan_hash: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self.artifacts.iter().find_map(|a| match &a.spec {
            ArtifactSpec::RunSnapshot { plan_hash: h, .. } if h == plan_hash => Some(a.clone()),
            _ => None,
        }))
    }

    async fn patch_chain(&self, head: ArtifactId) -> Result<PatchChain, StoreError> {
        let mut patches = Vec::new();
        let mut current = self.get(head).await?;
        let mut last_depth = u32::MAX;

        loop {
            match current.spec.clone() {
                ArtifactSpec::DagVersion { .. } => {
                    patches.reverse();
                    return Ok(PatchChain {
                        base: current,
                        patches,
                    });
                }
                ArtifactSpec::PatchSet {
                    base_version,
                    depth,
                    ..
                } => {
                    if depth >= last_depth {
                        return Err(StoreError::Corrupt {
                            detail: format!(
                                "patch chain depth not strictly decreasing at {}",
                                current.id
                            ),
                        });
                    }
                    last_depth = depth;
                    patches.push(current);
                    current = self.get(base_version).await?;
                }
                ArtifactSpec::RunSnapshot { .. } => {
                    return Err(StoreError::Corrupt {
                        detail: format!("run_snapshot {} cannot anchor a patch chain", current.id),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(version_hash: &str) -> Artifact {
        Artifact::new(
            CasId::digest(version_hash.as_bytes()),
            ArtifactSpec::DagVersion {
                version_hash: version_hash.to_string(),
                nodes_count: 2,
                edges_count: 1,
            },
        )
    }

    fn patch(base: ArtifactId, depth: u32) -> Artifact {
        Artifact::new(
            CasId::digest(format!("patch-{depth}").as_bytes()),
            ArtifactSpec::PatchSet {
                base_version: base,
                depth,
                op_count: 1,
            },
        )
    }

    #[tokio::test]
    async fn insert_is_immutable() {
        let catalog = MemoryCatalog::new();
        let artifact = dag("h1");
        catalog.insert(artifact.clone()).await.unwrap();
        assert!(matches!(
            catalog.insert(artifact).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn chain_walk_returns_base_to_head_order() {
        let catalog = MemoryCatalog::new();
        let base = dag("h1");
        let p1 = patch(base.id, 1);
        let p2 = patch(p1.id, 2);
        let p3 = patch(p2.id, 3);
        for a in [&base, &p1, &p2, &p3] {
            catalog.insert(a.clone()).await.unwrap();
        }

        let chain = catalog.patch_chain(p3.id).await.unwrap();
        assert_eq!(chain.base.id, base.id);
        assert_eq!(
            chain.patches.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![p1.id, p2.id, p3.id]
        );
        assert_eq!(chain.head().id, p3.id);
    }

    #[tokio::test]
    async fn chain_walk_of_dag_version_is_empty() {
        let catalog = MemoryCatalog::new();
        let base = dag("h1");
        catalog.insert(base.clone()).await.unwrap();
        let chain = catalog.patch_chain(base.id).await.unwrap();
        assert!(chain.patches.is_empty());
        assert_eq!(chain.head().id, base.id);
    }

    #[tokio::test]
    async fn non_decreasing_depth_is_corrupt() {
        let catalog = MemoryCatalog::new();
        let base = dag("h1");
        // two patches claiming the same depth, chained together
        let p1 = patch(base.id, 2);
        let p2 = patch(p1.id, 2);
        for a in [&base, &p1, &p2] {
            catalog.insert(a.clone()).await.unwrap();
        }
        assert!(matches!(
            catalog.patch_chain(p2.id).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn lookup_by_version_and_plan_hash() {
        let catalog = MemoryCatalog::new();
        let base = dag("vh-42");
        catalog.insert(base.clone()).await.unwrap();
        let snapshot = Artifact::new(
            CasId::digest(b"ir"),
            ArtifactSpec::RunSnapshot {
                plan_hash: "ph-1".to_string(),
                version_hash: "vh-42".to_string(),
            },
        );
        catalog.insert(snapshot.clone()).await.unwrap();

        let found = catalog.dag_by_version_hash("vh-42").await.unwrap().unwrap();
        assert_eq!(found.id, base.id);
        let found = catalog.snapshot_by_plan_hash("ph-1").await.unwrap().unwrap();
        assert_eq!(found.id, snapshot.id);
        assert!(catalog
            .dag_by_version_hash("missing")
            .await
            .unwrap()
            .is_none());
    }
}
