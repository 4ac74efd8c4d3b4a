//! Patch chain materializer
//!
//! Applies an ordered chain of JSON Patch blobs over a base workflow
//! document to yield the concrete document fed to the compiler. The output
//! is a pure function of (base bytes, patch bytes in order): no clocks, no
//! randomness, no map reordering.
//!
//! An operation failure aborts the whole materialization and surfaces the
//! offending `(seq, op_index)` - a half-applied document never escapes.

use serde_json::Value;
use thiserror::Error;

use crate::ast::{OpKind, PatchOp};
use crate::types::{ArtifactId, CasId};

/// Materialization failure
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("base document is not valid JSON: {0}")]
    BaseDocument(#[from] serde_json::Error),

    #[error("patch seq {seq} is not a valid operations blob: {reason}")]
    PatchBlob { seq: u64, reason: String },

    #[error("materialization failed at seq {seq}, op {op_index}: {reason}")]
    OpFailed {
        seq: u64,
        op_index: usize,
        reason: String,
    },
}

/// An ordered patch to apply: run-chain sequence number plus operations
#[derive(Debug, Clone)]
pub struct OrderedPatch {
    pub seq: u64,
    pub ops: Vec<PatchOp>,
}

/// Apply a patch chain over a base document value
///
/// An empty chain yields the unmodified base.
pub fn materialize(base: &Value, patches: &[OrderedPatch]) -> Result<Value, MaterializeError> {
    let mut doc = base.clone();
    for patch in patches {
        apply_ops(&mut doc, patch.seq, &patch.ops)?;
    }
    Ok(doc)
}

/// Apply a chain given raw CAS bytes for the base and each patch blob
pub fn materialize_bytes(
    base_bytes: &[u8],
    patch_blobs: &[(u64, Vec<u8>)],
) -> Result<Value, MaterializeError> {
    let base: Value = serde_json::from_slice(base_bytes)?;
    let mut patches = Vec::with_capacity(patch_blobs.len());
    for (seq, blob) in patch_blobs {
        let ops = PatchOp::parse_slice(blob).map_err(|e| MaterializeError::PatchBlob {
            seq: *seq,
            reason: e.to_string(),
        })?;
        patches.push(OrderedPatch { seq: *seq, ops });
    }
    materialize(&base, &patches)
}

/// Apply one patch's operations in order
pub fn apply_ops(doc: &mut Value, seq: u64, ops: &[PatchOp]) -> Result<(), MaterializeError> {
    for (op_index, op) in ops.iter().enumerate() {
        apply_one(doc, op).map_err(|reason| MaterializeError::OpFailed {
            seq,
            op_index,
            reason,
        })?;
    }
    Ok(())
}

/// Identity of a materialization: hash over the base artifact id and the
/// ordered patch artifact ids. Used to dedupe identical materialized IRs
/// across runs via `run_snapshot` artifacts.
pub fn plan_hash(base: ArtifactId, patch_ids: &[ArtifactId]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(base.to_string().as_bytes());
    for id in patch_ids {
        hasher.update(b"|");
        hasher.update(id.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Content hash of a materialized document (the `version_hash` recorded on
/// snapshot artifacts)
pub fn version_hash(doc: &Value) -> String {
    let bytes = serde_json::to_vec(doc).expect("document serializes");
    CasId::digest(&bytes).as_str().to_string()
}

// ============================================================================
// POINTER APPLICATION
// ============================================================================

/// Split a JSON Pointer, unescaping `~1` and `~0`
fn split_pointer(path: &str) -> Result<Vec<String>, String> {
    if path.is_empty() {
        return Ok(vec![]);
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| format!("path '{}' must start with '/'", path))?;
    Ok(rest
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn parse_index(segment: &str, len: usize, allow_end: bool) -> Result<usize, String> {
    if segment == "-" {
        if allow_end {
            return Ok(len);
        }
        return Err("'-' is only valid for add".to_string());
    }
    let index: usize = segment
        .parse()
        .map_err(|_| format!("'{}' is not an array index", segment))?;
    let max = if allow_end { len } else { len.saturating_sub(1) };
    if index > max || (!allow_end && len == 0) {
        return Err(format!("index {} out of bounds (len {})", index, len));
    }
    Ok(index)
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<(), String> {
    let segments = split_pointer(&op.path)?;

    if segments.is_empty() {
        // whole-document replacement
        return match op.op {
            OpKind::Replace | OpKind::Add => {
                let value = op
                    .value
                    .clone()
                    .ok_or_else(|| format!("{} requires a value", op.op))?;
                *doc = value;
                Ok(())
            }
            OpKind::Remove => Err("cannot remove the document root".to_string()),
        };
    }

    // navigate to the parent of the addressed location
    let (last, parents) = segments.split_last().expect("non-empty segments");
    let mut current = doc;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(segment)
                .ok_or_else(|| format!("path segment '{}' not found", segment))?,
            Value::Array(items) => {
                let index = parse_index(segment, items.len(), false)?;
                &mut items[index]
            }
            other => {
                return Err(format!(
                    "cannot traverse into {} at segment '{}'",
                    type_label(other),
                    segment
                ))
            }
        };
    }

    match op.op {
        OpKind::Add => {
            let value = op.value.clone().ok_or("add requires a value")?;
            match current {
                Value::Object(map) => {
                    map.insert(last.clone(), value);
                    Ok(())
                }
                Value::Array(items) => {
                    let index = parse_index(last, items.len(), true)?;
                    items.insert(index, value);
                    Ok(())
                }
                other => Err(format!("cannot add into {}", type_label(other))),
            }
        }
        OpKind::Remove => match current {
            Value::Object(map) => map
                .remove(last)
                .map(|_| ())
                .ok_or_else(|| format!("key '{}' not found", last)),
            Value::Array(items) => {
                let index = parse_index(last, items.len(), false)?;
                items.remove(index);
                Ok(())
            }
            other => Err(format!("cannot remove from {}", type_label(other))),
        },
        OpKind::Replace => {
            let value = op.value.clone().ok_or("replace requires a value")?;
            match current {
                Value::Object(map) => {
                    let slot = map
                        .get_mut(last)
                        .ok_or_else(|| format!("key '{}' not found", last))?;
                    *slot = value;
                    Ok(())
                }
                Value::Array(items) => {
                    let index = parse_index(last, items.len(), false)?;
                    items[index] = value;
                    Ok(())
                }
                other => Err(format!("cannot replace in {}", type_label(other))),
            }
        }
    }
}

fn type_label(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// TESTS
// ============================================================================
