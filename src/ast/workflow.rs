//! Workflow document types
//!
//! The workflow document is the unit stored in the CAS and addressed by
//! `dag_version` artifacts: a flat list of nodes and a flat list of directed
//! edges. It carries no derived information - dependencies, joins, terminals
//! and branch tables are inferred by the compiler.
//!
//! Documents are validated against [`WORKFLOW_SCHEMA`] before any semantic
//! pass, so shape errors surface with schema paths instead of panics deep in
//! the compiler.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// JSON Schema every workflow document must satisfy
///
/// Kept intentionally structural: semantic rules (dangling edge refs,
/// duplicate ids, terminal presence) belong to the compiler.
pub static WORKFLOW_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["nodes", "edges"],
        "properties": {
            "name": { "type": "string" },
            "nodes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id", "type"],
                    "properties": {
                        "id": { "type": "string", "minLength": 1 },
                        "type": { "type": "string", "minLength": 1 },
                        "config": { "type": "object" }
                    }
                }
            },
            "edges": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["from", "to"],
                    "properties": {
                        "from": { "type": "string", "minLength": 1 },
                        "to": { "type": "string", "minLength": 1 },
                        "condition": { "type": "string" }
                    }
                }
            }
        }
    })
});

static WORKFLOW_VALIDATOR: Lazy<jsonschema::Validator> = Lazy::new(|| {
    jsonschema::validator_for(&WORKFLOW_SCHEMA).expect("workflow schema compiles")
});

/// Failure to parse or schema-check a workflow document
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("workflow document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("workflow document violates schema: {details}")]
    Schema { details: String },
}

// ============================================================================
// DOCUMENT TYPES
// ============================================================================

/// A single declared node: id, worker type, opaque config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Worker configuration, resolved against prior outputs at dispatch time
    #[serde(default = "empty_object", skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

fn empty_object() -> Value {
    json!({})
}

/// A directed edge, optionally guarded by a condition expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// The versioned base document: what a `dag_version` artifact points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

impl WorkflowDoc {
    /// Schema-check a raw JSON value without deserializing
    pub fn validate_value(value: &Value) -> Result<(), DocumentError> {
        let errors: Vec<String> = WORKFLOW_VALIDATOR
            .iter_errors(value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DocumentError::Schema {
                details: errors.join("; "),
            })
        }
    }

    /// Parse from a raw JSON value, schema-checking first
    pub fn from_value(value: &Value) -> Result<Self, DocumentError> {
        Self::validate_value(value)?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Parse from raw bytes (the CAS payload of a `dag_version`)
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(&value)
    }

    /// Serialize to the canonical byte form stored in the CAS
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("workflow document serializes")
    }

    /// Serialize to a JSON value (the materializer patches this form)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("workflow document serializes")
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Count of agent-type nodes (drives rate-limit tiering and the
    /// runtime patch policy guard)
    pub fn agent_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.node_type == "agent").count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
