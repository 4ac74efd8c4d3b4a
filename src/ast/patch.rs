//! JSON Patch operation types
//!
//! The subset agents are allowed to emit: `add`, `remove`, `replace` over
//! `/nodes/-`, `/nodes/{i}`, `/edges/-`, `/edges/{i}` and nested config
//! paths. A patch blob in the CAS is a JSON array of these operations.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// JSON Schema for a patch blob (an array of operations)
pub static PATCH_OPS_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "array",
        "items": {
            "type": "object",
            "required": ["op", "path"],
            "properties": {
                "op": { "type": "string", "enum": ["add", "remove", "replace"] },
                "path": { "type": "string", "minLength": 1 },
                "value": {}
            }
        }
    })
});

static PATCH_VALIDATOR: Lazy<jsonschema::Validator> =
    Lazy::new(|| jsonschema::validator_for(&PATCH_OPS_SCHEMA).expect("patch schema compiles"));

/// Failure to parse a patch blob
#[derive(Debug, Error)]
pub enum PatchParseError {
    #[error("patch is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("patch violates schema: {details}")]
    Schema { details: String },
}

/// Operation kind (JSON Patch subset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Add => write!(f, "add"),
            OpKind::Remove => write!(f, "remove"),
            OpKind::Replace => write!(f, "replace"),
        }
    }
}

/// A single patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: OpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        PatchOp {
            op: OpKind::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        PatchOp {
            op: OpKind::Remove,
            path: path.into(),
            value: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        PatchOp {
            op: OpKind::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    /// Schema-check a raw operations array without deserializing
    pub fn validate_value(ops: &Value) -> Result<(), PatchParseError> {
        let errors: Vec<String> = PATCH_VALIDATOR
            .iter_errors(ops)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PatchParseError::Schema {
                details: errors.join("; "),
            })
        }
    }

    /// Parse an operations array from a raw JSON value
    pub fn parse_ops(ops: &Value) -> Result<Vec<PatchOp>, PatchParseError> {
        Self::validate_value(ops)?;
        Ok(serde_json::from_value(ops.clone())?)
    }

    /// Parse an operations array from raw bytes (the CAS payload of a
    /// `patch_set`)
    pub fn parse_slice(bytes: &[u8]) -> Result<Vec<PatchOp>, PatchParseError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::parse_ops(&value)
    }

    /// Serialize an operations array to its canonical CAS byte form
    pub fn ops_to_bytes(ops: &[PatchOp]) -> Vec<u8> {
        serde_json::to_vec(ops).expect("patch ops serialize")
    }
}

// ============================================================================
// TESTS
// ============================================================================
