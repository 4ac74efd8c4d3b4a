//! Patch validator - three-layer safety checks
//!
//! Agents are trusted to propose patches, not to finalize them. Validation
//! runs in three fail-fast layers:
//!
//! - **Layer A (structural)**: operation shape. Cheap syntactic checks,
//!   including the documented agent failure mode of emitting `config` as an
//!   array instead of an object.
//! - **Layer B (policy)**: hard cap on agent-type nodes added per patch.
//!   Re-checked at routing time through the hot-store patch guard.
//! - **Layer C (topological)**: speculative materialization must compile,
//!   newly added nodes must be reachable from a pre-existing node, and no
//!   edge may dangle.
//!
//! A rejected patch mutates nothing; the caller never persists it.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use thiserror::Error;

use crate::ast::{OpKind, PatchOp};
use crate::compiler::{self, CompileError};
use crate::ir::Ir;
use crate::materializer::{self, MaterializeError, OrderedPatch};

/// Default Layer B cap on agent nodes added per patch
pub const DEFAULT_MAX_AGENT_ADDS: usize = 5;

/// Validation failure, tagged by layer
#[derive(Debug, Error)]
pub enum PatchValidationError {
    #[error("structural: op {op_index}: {detail}")]
    Structural { op_index: usize, detail: String },

    #[error(
        "structural: op {op_index}: node config must be a JSON object, got {got} \
         (hint: emit config as {{\"key\": value}}, not an array of pairs)"
    )]
    NonObjectConfig { op_index: usize, got: &'static str },

    #[error("policy: patch adds {count} agent nodes, cap is {cap}")]
    AgentCapExceeded { count: usize, cap: usize },

    #[error("topological: speculative materialization failed: {0}")]
    Materialize(#[from] MaterializeError),

    #[error("topological: patched workflow does not compile: {0}")]
    Compile(#[from] CompileError),

    #[error("topological: added nodes are unreachable from existing nodes: {ids:?}")]
    OrphanNodes { ids: Vec<String> },
}

/// Outcome of a successful validation: the speculative document and its IR,
/// reusable by the caller to avoid a second materialization
#[derive(Debug)]
pub struct ValidatedPatch {
    pub doc: Value,
    pub ir: Ir,
    pub agent_adds: usize,
}

/// Run all three layers against the run's current materialized document
pub fn validate(
    ops: &[PatchOp],
    current_doc: &Value,
    seq: u64,
    max_agent_adds: usize,
) -> Result<ValidatedPatch, PatchValidationError> {
    check_structural(ops)?;
    let agent_adds = agent_adds(ops);
    if agent_adds > max_agent_adds {
        return Err(PatchValidationError::AgentCapExceeded {
            count: agent_adds,
            cap: max_agent_adds,
        });
    }
    let (doc, ir) = check_topological(ops, current_doc, seq)?;
    Ok(ValidatedPatch {
        doc,
        ir,
        agent_adds,
    })
}

// ============================================================================
// LAYER A - STRUCTURAL
// ============================================================================

/// Whether a path addresses a whole node entry (`/nodes/-` or `/nodes/{i}`)
fn is_node_entry_path(path: &str) -> bool {
    match path.strip_prefix("/nodes/") {
        Some(rest) => rest == "-" || rest.parse::<usize>().is_ok(),
        None => false,
    }
}

fn check_structural(ops: &[PatchOp]) -> Result<(), PatchValidationError> {
    for (op_index, op) in ops.iter().enumerate() {
        let err = |detail: String| PatchValidationError::Structural { op_index, detail };

        if op.path.is_empty() || !op.path.starts_with('/') {
            return Err(err(format!("path '{}' must start with '/'", op.path)));
        }

        match op.op {
            OpKind::Add | OpKind::Replace => {
                let value = op
                    .value
                    .as_ref()
                    .ok_or_else(|| err(format!("{} requires a value", op.op)))?;

                if is_node_entry_path(&op.path) {
                    let node = value
                        .as_object()
                        .ok_or_else(|| err("node value must be an object".to_string()))?;
                    if !node.get("id").map(Value::is_string).unwrap_or(false) {
                        return Err(err("node value requires a string 'id'".to_string()));
                    }
                    if !node.get("type").map(Value::is_string).unwrap_or(false) {
                        return Err(err("node value requires a string 'type'".to_string()));
                    }
                    if let Some(config) = node.get("config") {
                        if !config.is_object() {
                            return Err(PatchValidationError::NonObjectConfig {
                                op_index,
                                got: json_type(config),
                            });
                        }
                    }
                }
            }
            OpKind::Remove => {
                if op.value.is_some() {
                    return Err(err("remove does not take a value".to_string()));
                }
            }
        }
    }
    Ok(())
}

fn json_type(v: &Value) -> &'static str {
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
// LAYER B - POLICY
// ============================================================================

/// Count of agent-type nodes a patch adds
pub fn agent_adds(ops: &[PatchOp]) -> usize {
    ops.iter()
        .filter(|op| {
            op.op == OpKind::Add
                && is_node_entry_path(&op.path)
                && op
                    .value
                    .as_ref()
                    .and_then(|v| v.get("type"))
                    .and_then(Value::as_str)
                    == Some("agent")
        })
        .count()
}

// ============================================================================
// LAYER C - TOPOLOGICAL
// ============================================================================

fn node_ids(doc: &Value) -> HashSet<String> {
    doc.get("nodes")
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| n.get("id").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn check_topological(
    ops: &[PatchOp],
    current_doc: &Value,
    seq: u64,
) -> Result<(Value, Ir), PatchValidationError> {
    let existing = node_ids(current_doc);

    let doc = materializer::materialize(
        current_doc,
        &[OrderedPatch {
            seq,
            ops: ops.to_vec(),
        }],
    )?;

    // compiler enforces dangling edges, duplicate ids, terminal presence
    let ir = compiler::compile_value(&doc)?;

    // orphan detection: agents add nodes and forget the edges. BFS forward
    // from every pre-existing node; added nodes must all be visited.
    let added: HashSet<&String> = ir.nodes.keys().filter(|id| !existing.contains(*id)).collect();
    if !added.is_empty() {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = ir
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| existing.contains(*id))
            .collect();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = ir.node(id) {
                for next in &node.dependents {
                    if !visited.contains(next.as_str()) {
                        queue.push_back(next.as_str());
                    }
                }
            }
        }

        let mut orphans: Vec<String> = added
            .into_iter()
            .filter(|id| !visited.contains(id.as_str()))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            orphans.sort();
            return Err(PatchValidationError::OrphanNodes { ids: orphans });
        }
    }

    Ok((doc, ir))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_doc() -> Value {
        json!({
            "nodes": [
                {"id": "agent_1", "type": "agent", "config": {"prompt": "plan"}},
                {"id": "end", "type": "function"}
            ],
            "edges": [{"from": "agent_1", "to": "end"}]
        })
    }

    fn well_formed_extension() -> Vec<PatchOp> {
        vec![
            PatchOp::add("/nodes/-", json!({"id": "http_1", "type": "http"})),
            PatchOp::add("/edges/-", json!({"from": "agent_1", "to": "http_1"})),
            PatchOp::add("/edges/-", json!({"from": "http_1", "to": "end"})),
        ]
    }

    #[test]
    fn accepts_well_formed_extension() {
        let validated =
            validate(&well_formed_extension(), &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap();
        assert_eq!(validated.agent_adds, 0);
        assert!(validated.ir.node("http_1").is_some());
        assert_eq!(validated.doc["nodes"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn rejects_add_without_value() {
        let ops = vec![PatchOp {
            op: OpKind::Add,
            path: "/nodes/-".to_string(),
            value: None,
        }];
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        assert!(matches!(err, PatchValidationError::Structural { .. }));
    }

    #[test]
    fn rejects_node_without_id_or_type() {
        let ops = vec![PatchOp::add("/nodes/-", json!({"id": "x"}))];
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        assert!(matches!(err, PatchValidationError::Structural { .. }));
    }

    #[test]
    fn rejects_array_config_with_hint() {
        let ops = vec![PatchOp::add(
            "/nodes/-",
            json!({"id": "x", "type": "http", "config": [["url", "https://e.com"]]}),
        )];
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        match err {
            PatchValidationError::NonObjectConfig { got, .. } => assert_eq!(got, "an array"),
            other => panic!("unexpected: {other}"),
        }
        // the hint is part of the surfaced message
        let ops = vec![PatchOp::add(
            "/nodes/-",
            json!({"id": "x", "type": "http", "config": []}),
        )];
        let message = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS)
            .unwrap_err()
            .to_string();
        assert!(message.contains("hint"));
    }

    #[test]
    fn caps_agent_adds() {
        let mut ops = Vec::new();
        for i in 0..6 {
            let id = format!("spawn_{i}");
            ops.push(PatchOp::add(
                "/nodes/-",
                json!({"id": id.as_str(), "type": "agent"}),
            ));
            ops.push(PatchOp::add(
                "/edges/-",
                json!({"from": "agent_1", "to": id.as_str()}),
            ));
        }
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        assert!(matches!(
            err,
            PatchValidationError::AgentCapExceeded { count: 6, cap: 5 }
        ));
    }

    #[test]
    fn five_agent_adds_pass_policy() {
        let mut ops = Vec::new();
        for i in 0..5 {
            let id = format!("spawn_{i}");
            ops.push(PatchOp::add(
                "/nodes/-",
                json!({"id": id.as_str(), "type": "agent"}),
            ));
            ops.push(PatchOp::add(
                "/edges/-",
                json!({"from": "agent_1", "to": id.as_str()}),
            ));
        }
        let validated = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap();
        assert_eq!(validated.agent_adds, 5);
    }

    #[test]
    fn rejects_orphan_node() {
        let ops = vec![PatchOp::add(
            "/nodes/-",
            json!({"id": "lonely", "type": "http"}),
        )];
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        match err {
            PatchValidationError::OrphanNodes { ids } => assert_eq!(ids, vec!["lonely"]),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn outbound_only_node_is_still_an_orphan() {
        // an edge out of the new node does not make it reachable
        let ops = vec![
            PatchOp::add("/nodes/-", json!({"id": "header", "type": "http"})),
            PatchOp::add("/edges/-", json!({"from": "header", "to": "end"})),
        ];
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        assert!(matches!(err, PatchValidationError::OrphanNodes { .. }));
    }

    #[test]
    fn rejects_id_collision() {
        let ops = vec![
            PatchOp::add("/nodes/-", json!({"id": "end", "type": "http"})),
            PatchOp::add("/edges/-", json!({"from": "agent_1", "to": "end"})),
        ];
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        assert!(matches!(err, PatchValidationError::Compile(_)));
    }

    #[test]
    fn rejects_dangling_edge() {
        let ops = vec![PatchOp::add(
            "/edges/-",
            json!({"from": "agent_1", "to": "nowhere"}),
        )];
        let err = validate(&ops, &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        assert!(matches!(err, PatchValidationError::Compile(_)));
    }

    #[test]
    fn rejects_bad_materialization() {
        let ops = vec![PatchOp::remove("/nodes/9")];
        let err = validate(&ops, &base_doc(), 4, DEFAULT_MAX_AGENT_ADDS).unwrap_err();
        assert!(matches!(err, PatchValidationError::Materialize(_)));
    }

    #[test]
    fn empty_patch_is_accepted() {
        let validated = validate(&[], &base_doc(), 1, DEFAULT_MAX_AGENT_ADDS).unwrap();
        assert_eq!(validated.doc, base_doc());
    }
}
