//! Control-flow router
//!
//! Given a completed (or failed) node and its recorded output, decide the
//! successor set:
//!
//! 1. loop nodes: condition, then the guarded back-edge with its iteration
//!    cap (the counter counts loop-backs, so a run that breaks on its Nth
//!    completion observed N-1 iterations)
//! 2. branch nodes: first true rule wins, rule errors skip the rule,
//!    all-false falls to `default`
//! 3. everything else: the static dependents
//!
//! A failed signal is handled by the node's own loop (`break_path`) or
//! branch when one is configured; otherwise the decision is to fail the
//! run.
//!
//! `route()` always receives successfully loaded output and context:
//! load failures degrade in the coordinator before routing (loop ->
//! `break_path`, branch -> `default`, anything else fails the run).

use serde_json::Value;
use tracing::{debug, warn};

use crate::condition::ConditionEvaluator;
use crate::ir::{IrNode, SignalStatus};
use crate::store::{HotStore, StoreError};
use crate::types::RunId;

/// Routing outcome for one completion signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Emit these successors (possibly none)
    Next(Vec<String>),
    /// Unhandled worker failure: the run transitions to FAILED
    FailRun,
}

/// Decide the successor set for a completed node
pub async fn route(
    hot: &dyn HotStore,
    evaluator: &ConditionEvaluator,
    run_id: RunId,
    node: &IrNode,
    status: SignalStatus,
    output: &Value,
    ctx: &Value,
) -> Result<RouteDecision, StoreError> {
    if let Some(lc) = &node.loop_config {
        if status == SignalStatus::Failed {
            hot.clear_loop(run_id, &node.id).await?;
            return Ok(RouteDecision::Next(lc.break_path.clone()));
        }

        if let Some(condition) = &lc.condition {
            match evaluator.evaluate(condition, output, ctx) {
                Ok(true) => {} // keep looping, fall through to the cap
                Ok(false) => {
                    hot.clear_loop(run_id, &node.id).await?;
                    return Ok(RouteDecision::Next(lc.break_path.clone()));
                }
                Err(e) => {
                    // a broken condition cannot keep a loop alive
                    warn!(run = %run_id, node = %node.id, error = %e,
                          "loop condition error, breaking");
                    hot.clear_loop(run_id, &node.id).await?;
                    return Ok(RouteDecision::Next(lc.break_path.clone()));
                }
            }
        }

        let iteration = hot.incr_loop(run_id, &node.id).await?;
        if u64::from(iteration) >= u64::from(lc.max_iterations) {
            hot.clear_loop(run_id, &node.id).await?;
            debug!(run = %run_id, node = %node.id, iteration,
                   "loop cap reached, taking timeout path");
            return Ok(RouteDecision::Next(lc.timeout_path.clone()));
        }
        return Ok(RouteDecision::Next(vec![lc.loop_back_to.clone()]));
    }

    if let Some(branch) = &node.branch {
        for (index, rule) in branch.rules.iter().enumerate() {
            match evaluator.evaluate(&rule.condition, output, ctx) {
                Ok(true) => return Ok(RouteDecision::Next(rule.next_nodes.clone())),
                Ok(false) => {}
                Err(e) => {
                    debug!(run = %run_id, node = %node.id, rule = index, error = %e,
                           "branch rule error, skipping");
                }
            }
        }
        return Ok(RouteDecision::Next(branch.default.clone()));
    }

    if status == SignalStatus::Failed {
        return Ok(RouteDecision::FailRun);
    }
    Ok(RouteDecision::Next(node.dependents.clone()))
}

// ============================================================================
// TESTS
// ============================================================================
