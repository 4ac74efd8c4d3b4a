//! NewType wrappers for core identifiers
//!
//! Strongly-typed ids prevent mixing run, artifact, and blob identifiers,
//! and centralize the validation rules for user-supplied names.
//!
//! Time-sortable ids (runs, artifacts, jobs) are UUIDv7; content ids are
//! lowercase hex SHA-256 digests.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// TIME-SORTABLE IDS
// ============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocate a new time-sortable id (UUIDv7)
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(
    /// One execution of a workflow
    RunId
);

uuid_id!(
    /// A typed, immutable catalog record pointing into the CAS
    ArtifactId
);

// ============================================================================
// CONTENT-ADDRESSED ID
// ============================================================================

/// Content hash of a CAS blob (lowercase hex SHA-256)
///
/// Identical bytes always produce identical ids, which is what makes the
/// store deduplicating and materialization reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CasId(String);

impl CasId {
    /// Hash a payload into its content id
    pub fn digest(bytes: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        CasId(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed hex digest (e.g. read back from the catalog)
    pub fn from_hex(hex_digest: impl Into<String>) -> Self {
        CasId(hex_digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// USERNAME
// ============================================================================

/// Reserved namespace for service-owned tags
pub const GLOBAL_NAMESPACE: &str = "_global_";

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("username regex"));

static TAG_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_./-]{1,64}$").expect("tag name regex"));

/// Validation failure for a username
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsernameError {
    #[error("username cannot be empty")]
    Empty,
    #[error("invalid username '{0}': max 64 chars of [A-Za-z0-9_-]")]
    InvalidFormat(String),
}

/// Tag namespace owner
///
/// `_global_` is reserved for service-owned tags and accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(name: impl AsRef<str>) -> Result<Self, UsernameError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(UsernameError::Empty);
        }
        if name == GLOBAL_NAMESPACE {
            return Ok(Username(name.to_string()));
        }
        if !USERNAME_RE.is_match(name) {
            return Err(UsernameError::InvalidFormat(name.to_string()));
        }
        Ok(Username(name.to_string()))
    }

    /// The reserved `_global_` namespace
    pub fn global() -> Self {
        Username(GLOBAL_NAMESPACE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = UsernameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Username::new(s)
    }
}

// ============================================================================
// TAG NAME
// ============================================================================

/// Validation failure for a tag name
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagNameError {
    #[error("tag name cannot be empty")]
    Empty,
    #[error("invalid tag name '{0}': max 64 chars of [A-Za-z0-9_./-]")]
    InvalidFormat(String),
}

/// Mutable pointer name, scoped to a single username
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagName(String);

impl TagName {
    pub fn new(name: impl AsRef<str>) -> Result<Self, TagNameError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(TagNameError::Empty);
        }
        if !TAG_NAME_RE.is_match(name) {
            return Err(TagNameError::InvalidFormat(name.to_string()));
        }
        Ok(TagName(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TagName {
    type Err = TagNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagName::new(s)
    }
}

// ============================================================================
// TESTS
// ============================================================================
