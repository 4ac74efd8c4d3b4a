//! Tag registry
//!
//! Mutable `(username, tag_name)` pointers into the catalog with optimistic
//! versioning: every move is a compare-and-swap on the tag's monotonic
//! `version` and appends an audit row. Creation races resolve through the
//! uniqueness of the key - exactly one concurrent create wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::catalog::ArtifactKind;
use super::StoreError;
use crate::types::{ArtifactId, TagName, Username};

/// A mutable pointer to an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub username: Username,
    pub name: TagName,
    pub target_kind: ArtifactKind,
    pub target_id: ArtifactId,
    /// Content hash of the target at move time (audit convenience)
    pub target_hash: Option<String>,
    /// Monotonic counter for compare-and-swap moves
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// One audit row per tag move (creation included, with empty `from`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMove {
    pub username: Username,
    pub name: TagName,
    pub from_kind: Option<ArtifactKind>,
    pub from_id: Option<ArtifactId>,
    pub to_kind: ArtifactKind,
    pub to_id: ArtifactId,
    pub expected_hash: Option<String>,
    pub actor: String,
    pub moved_at: DateTime<Utc>,
}

/// Registry of mutable per-user tags
#[async_trait]
pub trait TagRegistry: Send + Sync {
    /// Create a tag; fails with a conflict if `(username, name)` exists
    async fn create(
        &self,
        username: Username,
        name: TagName,
        target_kind: ArtifactKind,
        target_id: ArtifactId,
        target_hash: Option<String>,
        actor: &str,
    ) -> Result<Tag, StoreError>;

    /// Compare-and-swap move: succeeds only when `expected_version` matches
    /// the current version; the new version is `expected_version + 1`
    #[allow(clippy::too_many_arguments)]
    async fn move_tag(
        &self,
        username: &Username,
        name: &TagName,
        new_kind: ArtifactKind,
        new_id: ArtifactId,
        new_hash: Option<String>,
        expected_version: u64,
        actor: &str,
    ) -> Result<Tag, StoreError>;

    async fn get(&self, username: &Username, name: &TagName) -> Result<Tag, StoreError>;

    async fn delete(&self, username: &Username, name: &TagName) -> Result<(), StoreError>;

    async fn list_by_user(&self, username: &Username) -> Result<Vec<Tag>, StoreError>;

    /// Move history for a tag, oldest first
    async fn history(&self, username: &Username, name: &TagName)
        -> Result<Vec<TagMove>, StoreError>;
}

type TagKey = (Username, TagName);

/// In-memory reference implementation
///
/// Move linearizability per tag comes from mutating under the DashMap entry
/// guard; the audit log is a single mutex-protected vector.
#[derive(Debug, Default)]
pub struct MemoryTagRegistry {
    tags: DashMap<TagKey, Tag>,
    moves: Mutex<Vec<TagMove>>,
}

impl MemoryTagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_move(&self, row: TagMove) {
        self.moves.lock().push(row);
    }
}

#[async_trait]
impl TagRegistry for MemoryTagRegistry {
    async fn create(
        &self,
        username: Username,
        name: TagName,
        target_kind: ArtifactKind,
        target_id: ArtifactId,
        target_hash: Option<String>,
        actor: &str,
    ) -> Result<Tag, StoreError> {
        let key = (username.clone(), name.clone());
        let tag = Tag {
            username: username.clone(),
            name: name.clone(),
            target_kind,
            target_id,
            target_hash: target_hash.clone(),
            version: 1,
            updated_at: Utc::now(),
        };

        match self.tags.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::conflict(format!(
                "tag {}/{} already exists",
                username, name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tag.clone());
                self.record_move(TagMove {
                    username,
                    name,
                    from_kind: None,
                    from_id: None,
                    to_kind: target_kind,
                    to_id: target_id,
                    expected_hash: target_hash,
                    actor: actor.to_string(),
                    moved_at: tag.updated_at,
                });
                Ok(tag)
            }
        }
    }

    async fn move_tag(
        &self,
        username: &Username,
        name: &TagName,
        new_kind: ArtifactKind,
        new_id: ArtifactId,
        new_hash: Option<String>,
        expected_version: u64,
        actor: &str,
    ) -> Result<Tag, StoreError> {
        let key = (username.clone(), name.clone());
        let mut entry = self
            .tags
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found("tag", format!("{}/{}", username, name)))?;

        if entry.version != expected_version {
            return Err(StoreError::conflict(format!(
                "tag {}/{} version mismatch: expected {}, found {}",
                username, name, expected_version, entry.version
            )));
        }

        let row = TagMove {
            username: username.clone(),
            name: name.clone(),
            from_kind: Some(entry.target_kind),
            from_id: Some(entry.target_id),
            to_kind: new_kind,
            to_id: new_id,
            expected_hash: new_hash.clone(),
            actor: actor.to_string(),
            moved_at: Utc::now(),
        };

        entry.target_kind = new_kind;
        entry.target_id = new_id;
        entry.target_hash = new_hash;
        entry.version += 1;
        entry.updated_at = row.moved_at;
        let updated = entry.clone();
        drop(entry);

        self.record_move(row);
        Ok(updated)
    }

    async fn get(&self, username: &Username, name: &TagName) -> Result<Tag, StoreError> {
        self.tags
            .get(&(username.clone(), name.clone()))
            .map(|t| t.clone())
            .ok_or_else(|| StoreError::not_found("tag", format!("{}/{}", username, name)))
    }

    async fn delete(&self, username: &Username, name: &TagName) -> Result<(), StoreError> {
        self.tags
            .remove(&(username.clone(), name.clone()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("tag", format!("{}/{}", username, name)))
    }

    async fn list_by_user(&self, username: &Username) -> Result<Vec<Tag>, StoreError> {
        let mut tags: Vec<Tag> = self
            .tags
            .iter()
            .filter(|t| &t.username == username)
            .map(|t| t.clone())
            .collect();
        tags.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        Ok(tags)
    }

    async fn history(
        &self,
        username: &Username,
        name: &TagName,
    ) -> Result<Vec<TagMove>, StoreError> {
        Ok(self
            .moves
            .lock()
            .iter()
            .filter(|m| &m.username == username && &m.name == name)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Username {
        Username::new("alice").unwrap()
    }

    fn tag_name() -> TagName {
        TagName::new("prod").unwrap()
    }

    #[tokio::test]
    async fn create_then_duplicate_conflicts() {
        let registry = MemoryTagRegistry::new();
        let target = ArtifactId::generate();
        registry
            .create(user(), tag_name(), ArtifactKind::DagVersion, target, None, "alice")
            .await
            .unwrap();
        let err = registry
            .create(user(), tag_name(), ArtifactKind::DagVersion, target, None, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn same_name_different_user_is_fine() {
        let registry = MemoryTagRegistry::new();
        let target = ArtifactId::generate();
        registry
            .create(user(), tag_name(), ArtifactKind::DagVersion, target, None, "alice")
            .await
            .unwrap();
        registry
            .create(
                Username::new("bob").unwrap(),
                tag_name(),
                ArtifactKind::DagVersion,
                target,
                None,
                "bob",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn move_is_compare_and_swap() {
        let registry = MemoryTagRegistry::new();
        let v1 = ArtifactId::generate();
        let v2 = ArtifactId::generate();
        let created = registry
            .create(user(), tag_name(), ArtifactKind::DagVersion, v1, None, "alice")
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        let moved = registry
            .move_tag(
                &user(),
                &tag_name(),
                ArtifactKind::PatchSet,
                v2,
                None,
                1,
                "alice",
            )
            .await
            .unwrap();
        assert_eq!(moved.version, 2);
        assert_eq!(moved.target_id, v2);

        // a second mover still presenting version 1 loses, with no change
        let err = registry
            .move_tag(
                &user(),
                &tag_name(),
                ArtifactKind::DagVersion,
                v1,
                None,
                1,
                "mallory",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(registry.get(&user(), &tag_name()).await.unwrap().target_id, v2);
    }

    #[tokio::test]
    async fn history_records_every_move() {
        let registry = MemoryTagRegistry::new();
        let v1 = ArtifactId::generate();
        let v2 = ArtifactId::generate();
        registry
            .create(user(), tag_name(), ArtifactKind::DagVersion, v1, None, "alice")
            .await
            .unwrap();
        registry
            .move_tag(&user(), &tag_name(), ArtifactKind::PatchSet, v2, None, 1, "ci")
            .await
            .unwrap();

        let history = registry.history(&user(), &tag_name()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_id, None);
        assert_eq!(history[1].from_id, Some(v1));
        assert_eq!(history[1].to_id, v2);
        assert_eq!(history[1].actor, "ci");
    }

    #[tokio::test]
    async fn list_by_user_is_scoped_and_sorted() {
        let registry = MemoryTagRegistry::new();
        let target = ArtifactId::generate();
        for name in ["zeta", "alpha"] {
            registry
                .create(
                    user(),
                    TagName::new(name).unwrap(),
                    ArtifactKind::DagVersion,
                    target,
                    None,
                    "alice",
                )
                .await
                .unwrap();
        }
        registry
            .create(
                Username::new("bob").unwrap(),
                TagName::new("other").unwrap(),
                ArtifactKind::DagVersion,
                target,
                None,
                "bob",
            )
            .await
            .unwrap();

        let tags = registry.list_by_user(&user()).await.unwrap();
        let names: Vec<_> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn delete_removes_pointer() {
        let registry = MemoryTagRegistry::new();
        registry
            .create(
                user(),
                tag_name(),
                ArtifactKind::DagVersion,
                ArtifactId::generate(),
                None,
                "alice",
            )
            .await
            .unwrap();
        registry.delete(&user(), &tag_name()).await.unwrap();
        assert!(matches!(
            registry.get(&user(), &tag_name()).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
