//! Intermediate Representation - the compiled, executable workflow
//!
//! The IR is what the coordinator routes against: a map of nodes with their
//! derived dependencies, dependents, join/terminal flags and control-flow
//! configs. It is held in the hot cache as JSON bytes keyed by run id and
//! swapped wholesale when a runtime patch installs.
//!
//! Nodes live in a `BTreeMap` so serialized IR bytes are deterministic for a
//! given topology; routing order uses the per-node `dependents` vectors,
//! which preserve edge declaration order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CasId, RunId};

/// Wire version stamped on completion signals
pub const SIGNAL_VERSION: u32 = 1;

/// Node types dispatched to worker streams (`wf.tasks.{type}`)
///
/// Anything else compiles, but a non-executable node only runs if it carries
/// branch/loop config the coordinator can absorb inline.
pub const EXECUTABLE_TYPES: &[&str] = &[
    "http",
    "hitl",
    "agent",
    "function",
    "transform",
    "aggregate",
    "filter",
];

/// Whether a node type maps to a worker stream
pub fn is_executable_type(node_type: &str) -> bool {
    EXECUTABLE_TYPES.contains(&node_type)
}

// ============================================================================
// CONDITIONS
// ============================================================================

/// A declarative predicate over `{output, ctx}`
///
/// Conditions are data - they live in workflow documents and in patches
/// authored by agents - so they are expressed in a sandboxed expression
/// language rather than code. `"cel"` is the only supported type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type", default = "default_condition_type")]
    pub kind: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub invert: bool,
}

fn default_condition_type() -> String {
    "cel".to_string()
}

impl Condition {
    /// A plain CEL condition
    pub fn cel(expression: impl Into<String>) -> Self {
        Condition {
            kind: default_condition_type(),
            expression: expression.into(),
            invert: false,
        }
    }
}

// ============================================================================
// CONTROL-FLOW CONFIGS
// ============================================================================

/// One branch rule: condition plus the successor set it selects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    pub condition: Condition,
    pub next_nodes: Vec<String>,
}

/// Ordered branch table evaluated on node completion
///
/// Rules are tried in order; the first true condition wins. All-false falls
/// through to `default` (which may be empty - the branch then terminates
/// that path).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BranchConfig {
    pub rules: Vec<BranchRule>,
    #[serde(default)]
    pub default: Vec<String>,
}

/// Guarded back-edge config
///
/// Loops never appear as IR cycles: `loop_back_to` is synthesized by the
/// router on condition success and capped by `max_iterations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub loop_back_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub break_path: Vec<String>,
    #[serde(default)]
    pub timeout_path: Vec<String>,
}

// ============================================================================
// IR NODES
// ============================================================================

/// One compiled node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Unresolved worker config; `$nodes.*` references substitute at dispatch
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    /// CAS reference for oversized configs (config is then a stub)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<CasId>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<String>,
    /// Join flag: emit only once every dependency has a recorded output
    #[serde(default)]
    pub wait_for_all: bool,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchConfig>,
}

impl IrNode {
    /// Executable nodes dispatch to `wf.tasks.{type}`; everything else with
    /// branch/loop config is absorbed inline by the coordinator.
    pub fn is_executable(&self) -> bool {
        is_executable_type(&self.node_type)
    }

    /// Absorber: coordinator evaluates the node without a worker
    pub fn is_absorber(&self) -> bool {
        !self.is_executable() && (self.branch.is_some() || self.loop_config.is_some())
    }
}

/// The materialized, compiled workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ir {
    pub nodes: BTreeMap<String, IrNode>,
}

impl Ir {
    pub fn node(&self, id: &str) -> Option<&IrNode> {
        self.nodes.get(id)
    }

    /// Nodes with no dependencies - seeded at run start
    pub fn root_nodes(&self) -> Vec<&IrNode> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .collect()
    }

    /// Count of agent-type nodes (checked against the patch policy guard at
    /// routing time)
    pub fn agent_node_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.node_type == "agent")
            .count()
    }

    /// Serialize to the byte form installed under `ir:{run_id}`
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("IR serializes")
    }

    /// Deserialize from hot-cache bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ============================================================================
// TOKENS AND SIGNALS
// ============================================================================

/// The unit of work dispatched to a worker stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Derived from `(run, from, to, triggering job)` so a crash-redriven
    /// emission reuses the same id and op key
    pub id: String,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<String>,
    pub to_node: String,
    /// CAS reference to the upstream output that triggered this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<CasId>,
    /// Pre-resolved worker config
    pub config: Value,
    pub hop: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Deterministic token id for an emission cause
    ///
    /// Redriving the same completion signal re-derives the same id, which is
    /// what makes re-emission a no-op under the applied-op set.
    pub fn derive_id(run_id: RunId, from: Option<&str>, to: &str, cause: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(run_id.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(from.unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(to.as_bytes());
        hasher.update(b"|");
        hasher.update(cause.as_bytes());
        let digest = hasher.finalize();
        format!("tok-{}", hex::encode(&digest[..16]))
    }
}

/// Worker-reported outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Completed,
    Failed,
}

/// Worker-to-coordinator acknowledgment that a node finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    #[serde(default = "default_signal_version")]
    pub version: u32,
    /// Worker execution identity; workers echo the token id so redelivered
    /// executions share one consume op key
    pub job_id: String,
    pub run_id: RunId,
    pub node_id: String,
    pub status: SignalStatus,
    /// Inline result payload; persisted to the CAS by the coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
    /// Pre-persisted result reference (workers that write the CAS directly)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<CasId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn default_signal_version() -> u32 {
    SIGNAL_VERSION
}

impl CompletionSignal {
    pub fn completed(run_id: RunId, node_id: impl Into<String>, result: Value) -> Self {
        CompletionSignal {
            version: SIGNAL_VERSION,
            job_id: uuid::Uuid::new_v4().to_string(),
            run_id,
            node_id: node_id.into(),
            status: SignalStatus::Completed,
            result_data: Some(result),
            result_ref: None,
            metadata: None,
        }
    }

    pub fn failed(run_id: RunId, node_id: impl Into<String>, error: Value) -> Self {
        CompletionSignal {
            version: SIGNAL_VERSION,
            job_id: uuid::Uuid::new_v4().to_string(),
            run_id,
            node_id: node_id.into(),
            status: SignalStatus::Failed,
            result_data: Some(error),
            result_ref: None,
            metadata: None,
        }
    }
}

// ============================================================================
// RUN STATUS
// ============================================================================

/// Cold-store run status
///
/// Transitions are monotonic within a run; the projector drops regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingForApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Ordering rank used by the projector's monotonic guard
    ///
    /// RUNNING and WAITING_FOR_APPROVAL share a rank: a run parks and
    /// resumes freely, but never returns to QUEUED or leaves a terminal
    /// state.
    pub fn rank(&self) -> u8 {
        match self {
            RunStatus::Queued => 0,
            RunStatus::Running | RunStatus::WaitingForApproval => 1,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::WaitingForApproval => "WAITING_FOR_APPROVAL",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// One entry on the `run.status.updates` stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub run_id: RunId,
    pub status: RunStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn now(run_id: RunId, status: RunStatus) -> Self {
        StatusUpdate {
            run_id,
            status,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
