//! Workflow compiler - document to IR
//!
//! Derives everything the coordinator routes on: dependency and dependent
//! lists (in edge declaration order), join flags (`wait_for_all` for nodes
//! with more than one dependency), terminal flags (no dependents), branch
//! tables translated from conditional edges, and loop configs lifted from
//! node config.
//!
//! The static edge set must be a DAG with at least one exit: a document
//! whose every node has an outbound edge can only be a cycle with no exit
//! and is rejected with `no_terminal_nodes`. Loop back-edges never appear
//! in `dependents`; the router synthesizes them at runtime.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

use crate::ast::{DocumentError, WorkflowDoc};
use crate::ir::{BranchConfig, BranchRule, Condition, Ir, IrNode, LoopConfig};

/// Compilation failure
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Document(#[from] DocumentError),

    #[error("duplicate node id '{id}'")]
    DuplicateNode { id: String },

    #[error("invalid reference: edge {index} ({which}) refers to unknown node '{node_id}'")]
    InvalidRef {
        index: usize,
        which: &'static str,
        node_id: String,
    },

    #[error("workflow has no terminal nodes")]
    NoTerminalNodes,

    #[error("invalid loop config on '{node_id}': {reason}")]
    InvalidLoop { node_id: String, reason: String },

    #[error("invalid branch config on '{node_id}': {reason}")]
    InvalidBranch { node_id: String, reason: String },
}

/// Compile a parsed document into executable IR
pub fn compile(doc: &WorkflowDoc) -> Result<Ir, CompileError> {
    // unique ids first: every later lookup assumes them
    let mut ids = HashSet::with_capacity(doc.nodes.len());
    for node in &doc.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(CompileError::DuplicateNode {
                id: node.id.clone(),
            });
        }
    }

    for (index, edge) in doc.edges.iter().enumerate() {
        if !ids.contains(edge.from.as_str()) {
            return Err(CompileError::InvalidRef {
                index,
                which: "from",
                node_id: edge.from.clone(),
            });
        }
        if !ids.contains(edge.to.as_str()) {
            return Err(CompileError::InvalidRef {
                index,
                which: "to",
                node_id: edge.to.clone(),
            });
        }
    }

    // dependencies/dependents in edge declaration order, deduplicated
    let mut dependencies: HashMap<&str, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<String>> = HashMap::new();
    for edge in &doc.edges {
        let deps = dependencies.entry(edge.to.as_str()).or_default();
        if !deps.contains(&edge.from) {
            deps.push(edge.from.clone());
        }
        let outs = dependents.entry(edge.from.as_str()).or_default();
        if !outs.contains(&edge.to) {
            outs.push(edge.to.clone());
        }
    }

    let mut nodes = BTreeMap::new();
    let mut has_terminal = false;

    for node in &doc.nodes {
        let deps = dependencies.remove(node.id.as_str()).unwrap_or_default();
        let outs = dependents.remove(node.id.as_str()).unwrap_or_default();
        let is_terminal = outs.is_empty();
        has_terminal |= is_terminal;

        let loop_config = parse_loop(&node.id, &node.config, &ids)?;
        let branch = build_branch(&node.id, &node.config, doc, &ids)?;

        nodes.insert(
            node.id.clone(),
            IrNode {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
                config: strip_control_keys(&node.config),
                config_ref: None,
                wait_for_all: deps.len() > 1,
                is_terminal,
                dependencies: deps,
                dependents: outs,
                loop_config,
                branch,
            },
        );
    }

    if !has_terminal {
        return Err(CompileError::NoTerminalNodes);
    }

    Ok(Ir { nodes })
}

/// Schema-check, parse and compile a raw JSON document (the materializer's
/// output form)
pub fn compile_value(value: &Value) -> Result<Ir, CompileError> {
    let doc = WorkflowDoc::from_value(value)?;
    compile(&doc)
}

/// Loop and branch settings live under reserved config keys; the worker
/// config a token carries omits them.
fn strip_control_keys(config: &Value) -> Value {
    match config {
        Value::Object(map) => {
            let mut stripped = map.clone();
            stripped.remove("loop");
            stripped.remove("branch");
            Value::Object(stripped)
        }
        other => other.clone(),
    }
}

// ============================================================================
// LOOP CONFIG
// ============================================================================

fn parse_loop(
    node_id: &str,
    config: &Value,
    ids: &HashSet<&str>,
) -> Result<Option<LoopConfig>, CompileError> {
    let raw = match config.get("loop") {
        Some(raw) => raw,
        None => return Ok(None),
    };

    let err = |reason: &str| CompileError::InvalidLoop {
        node_id: node_id.to_string(),
        reason: reason.to_string(),
    };

    let parsed: LoopConfig = serde_json::from_value(raw.clone())
        .map_err(|e| err(&format!("malformed loop config: {}", e)))?;

    if !ids.contains(parsed.loop_back_to.as_str()) {
        return Err(err(&format!(
            "loop_back_to refers to unknown node '{}'",
            parsed.loop_back_to
        )));
    }
    for target in parsed.break_path.iter().chain(&parsed.timeout_path) {
        if !ids.contains(target.as_str()) {
            return Err(err(&format!("path refers to unknown node '{}'", target)));
        }
    }

    Ok(Some(parsed))
}

// ============================================================================
// BRANCH CONFIG
// ============================================================================

/// Merge an explicit `config.branch` with rules translated from conditional
/// edges: explicit rules first, edge rules in edge order, defaults unioned
/// with unconditioned edge targets.
fn build_branch(
    node_id: &str,
    config: &Value,
    doc: &WorkflowDoc,
    ids: &HashSet<&str>,
) -> Result<Option<BranchConfig>, CompileError> {
    let err = |reason: String| CompileError::InvalidBranch {
        node_id: node_id.to_string(),
        reason,
    };

    let mut explicit: Option<BranchConfig> = match config.get("branch") {
        Some(raw) => Some(
            serde_json::from_value(raw.clone())
                .map_err(|e| err(format!("malformed branch config: {}", e)))?,
        ),
        None => None,
    };

    let outgoing: Vec<_> = doc.edges.iter().filter(|e| e.from == node_id).collect();
    let has_conditional = outgoing.iter().any(|e| e.condition.is_some());

    if has_conditional {
        let branch = explicit.get_or_insert_with(BranchConfig::default);
        for edge in &outgoing {
            match &edge.condition {
                Some(expression) => branch.rules.push(BranchRule {
                    condition: Condition::cel(expression.clone()),
                    next_nodes: vec![edge.to.clone()],
                }),
                None => {
                    if !branch.default.contains(&edge.to) {
                        branch.default.push(edge.to.clone());
                    }
                }
            }
        }
    }

    if let Some(branch) = &explicit {
        for target in branch
            .rules
            .iter()
            .flat_map(|r| &r.next_nodes)
            .chain(&branch.default)
        {
            if !ids.contains(target.as_str()) {
                return Err(err(format!("rule refers to unknown node '{}'", target)));
            }
        }
    }

    Ok(explicit)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> WorkflowDoc {
        WorkflowDoc::from_value(&value).unwrap()
    }

    fn linear_doc() -> WorkflowDoc {
        doc(json!({
            "nodes": [
                {"id": "a", "type": "http"},
                {"id": "b", "type": "transform"},
                {"id": "c", "type": "http"}
            ],
            "edges": [
                {"from": "a", "to": "b"},
                {"from": "b", "to": "c"}
            ]
        }))
    }

    #[test]
    fn derives_dependencies_and_terminals() {
        let ir = compile(&linear_doc()).unwrap();
        let a = ir.node("a").unwrap();
        let b = ir.node("b").unwrap();
        let c = ir.node("c").unwrap();

        assert!(a.dependencies.is_empty());
        assert_eq!(a.dependents, vec!["b"]);
        assert_eq!(b.dependencies, vec!["a"]);
        assert!(!b.wait_for_all);
        assert!(c.is_terminal);
        assert!(!a.is_terminal);
    }

    #[test]
    fn join_nodes_wait_for_all() {
        let ir = compile(&doc(json!({
            "nodes": [
                {"id": "a", "type": "http"},
                {"id": "b", "type": "http"},
                {"id": "c", "type": "http"},
                {"id": "d", "type": "aggregate"}
            ],
            "edges": [
                {"from": "a", "to": "b"},
                {"from": "a", "to": "c"},
                {"from": "b", "to": "d"},
                {"from": "c", "to": "d"}
            ]
        })))
        .unwrap();

        let d = ir.node("d").unwrap();
        assert!(d.wait_for_all);
        assert_eq!(d.dependencies, vec!["b", "c"]);
        assert_eq!(ir.node("a").unwrap().dependents, vec!["b", "c"]);
    }

    #[test]
    fn dangling_edge_is_invalid_ref() {
        let result = compile(&doc(json!({
            "nodes": [{"id": "a", "type": "http"}],
            "edges": [{"from": "a", "to": "ghost"}]
        })));
        assert!(matches!(
            result,
            Err(CompileError::InvalidRef { which: "to", .. })
        ));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let result = compile(&doc(json!({
            "nodes": [
                {"id": "a", "type": "http"},
                {"id": "a", "type": "transform"}
            ],
            "edges": []
        })));
        assert!(matches!(result, Err(CompileError::DuplicateNode { .. })));
    }

    #[test]
    fn cycle_without_exit_has_no_terminal() {
        let result = compile(&doc(json!({
            "nodes": [
                {"id": "a", "type": "http"},
                {"id": "b", "type": "http"}
            ],
            "edges": [
                {"from": "a", "to": "b"},
                {"from": "b", "to": "a"}
            ]
        })));
        assert!(matches!(result, Err(CompileError::NoTerminalNodes)));
    }

    #[test]
    fn conditional_edges_become_branch_rules() {
        let ir = compile(&doc(json!({
            "nodes": [
                {"id": "check", "type": "function"},
                {"id": "high", "type": "http"},
                {"id": "low", "type": "http"},
                {"id": "audit", "type": "http"}
            ],
            "edges": [
                {"from": "check", "to": "high", "condition": "output.score > 80"},
                {"from": "check", "to": "low", "condition": "output.score <= 80"},
                {"from": "check", "to": "audit"}
            ]
        })))
        .unwrap();

        let branch = ir.node("check").unwrap().branch.as_ref().unwrap();
        assert_eq!(branch.rules.len(), 2);
        assert_eq!(branch.rules[0].condition.expression, "output.score > 80");
        assert_eq!(branch.rules[0].next_nodes, vec!["high"]);
        assert_eq!(branch.rules[1].next_nodes, vec!["low"]);
        assert_eq!(branch.default, vec!["audit"]);
        // static dependents still list every target
        assert_eq!(
            ir.node("check").unwrap().dependents,
            vec!["high", "low", "audit"]
        );
    }

    #[test]
    fn unconditional_edges_build_no_branch() {
        let ir = compile(&linear_doc()).unwrap();
        assert!(ir.node("a").unwrap().branch.is_none());
    }

    #[test]
    fn loop_config_is_lifted_and_stripped() {
        let ir = compile(&doc(json!({
            "nodes": [
                {"id": "retry", "type": "http", "config": {
                    "url": "https://example.com",
                    "loop": {
                        "max_iterations": 5,
                        "loop_back_to": "retry",
                        "condition": {"expression": "output.status != 'success'"},
                        "break_path": ["ok"]
                    }
                }},
                {"id": "ok", "type": "http"}
            ],
            "edges": [{"from": "retry", "to": "ok"}]
        })))
        .unwrap();

        let retry = ir.node("retry").unwrap();
        let lc = retry.loop_config.as_ref().unwrap();
        assert_eq!(lc.max_iterations, 5);
        assert_eq!(lc.loop_back_to, "retry");
        assert_eq!(lc.break_path, vec!["ok"]);
        assert!(lc.timeout_path.is_empty());
        // worker config no longer carries control keys
        assert_eq!(retry.config, json!({"url": "https://example.com"}));
    }

    #[test]
    fn loop_back_to_unknown_node_is_rejected() {
        let result = compile(&doc(json!({
            "nodes": [
                {"id": "a", "type": "http", "config": {
                    "loop": {"max_iterations": 3, "loop_back_to": "ghost"}
                }},
                {"id": "b", "type": "http"}
            ],
            "edges": [{"from": "a", "to": "b"}]
        })));
        assert!(matches!(result, Err(CompileError::InvalidLoop { .. })));
    }

    #[test]
    fn loop_missing_max_iterations_is_rejected() {
        let result = compile(&doc(json!({
            "nodes": [
                {"id": "a", "type": "http", "config": {"loop": {"loop_back_to": "a"}}},
                {"id": "b", "type": "http"}
            ],
            "edges": [{"from": "a", "to": "b"}]
        })));
        assert!(matches!(result, Err(CompileError::InvalidLoop { .. })));
    }

    #[test]
    fn branch_rule_to_unknown_node_is_rejected() {
        let result = compile(&doc(json!({
            "nodes": [
                {"id": "a", "type": "function", "config": {
                    "branch": {
                        "rules": [
                            {"condition": {"expression": "true"}, "next_nodes": ["ghost"]}
                        ]
                    }
                }},
                {"id": "b", "type": "http"}
            ],
            "edges": [{"from": "a", "to": "b"}]
        })));
        assert!(matches!(result, Err(CompileError::InvalidBranch { .. })));
    }

    #[test]
    fn compile_is_deterministic() {
        let ir1 = compile(&linear_doc()).unwrap();
        let ir2 = compile(&linear_doc()).unwrap();
        assert_eq!(ir1.to_bytes(), ir2.to_bytes());
    }

    #[test]
    fn compile_value_schema_checks_first() {
        let bad = json!({"nodes": "not-an-array", "edges": []});
        assert!(matches!(
            compile_value(&bad),
            Err(CompileError::Document(_))
        ));
    }
}
