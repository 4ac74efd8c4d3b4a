//! Runner Module - stateless choreography execution
//!
//! The coordinator side of the system: everything between a submitted run
//! and its terminal status.
//!
//! - [`submit`]: resolve a base reference, materialize, compile, install,
//!   seed the root tokens
//! - [`coordinator`]: the signal loop - consume, count, route, emit
//! - [`router`]: per-node successor decisions (loop, branch, static)
//! - [`pipeline`]: the runtime patch pipeline (validate, persist,
//!   rematerialize, hot-install)
//! - [`projector`]: project status updates into the durable run record
//!
//! No component here owns a run. All coordination state lives in the hot
//! store, so any process (or any task in a process) can service any run's
//! next signal.

pub mod coordinator;
pub mod pipeline;
pub mod projector;
pub mod router;
pub mod submit;

pub use coordinator::Coordinator;
pub use pipeline::{PatchPipeline, PatchReceipt, PatchSubmission};
pub use projector::StatusProjector;
pub use router::RouteDecision;
pub use submit::{BaseRef, SubmitRequest, Submitter};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future;
use serde_json::Value;

use crate::condition::ConditionEvaluator;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::ir::{CompletionSignal, Ir, IrNode, SignalStatus, Token, SIGNAL_VERSION};
use crate::store::{
    self, ArtifactCatalog, Cas, HotStore, MemoryCas, MemoryCatalog, MemoryHotStore,
    MemoryRunStore, MemoryTagRegistry, RunStore, StreamBus, TagRegistry,
};
use crate::types::{CasId, RunId};

/// Shared handles every runner component works through
pub struct Services {
    pub cas: Arc<dyn Cas>,
    pub catalog: Arc<dyn ArtifactCatalog>,
    pub tags: Arc<dyn TagRegistry>,
    pub runs: Arc<dyn RunStore>,
    pub hot: Arc<dyn HotStore>,
    pub bus: Arc<StreamBus>,
    pub evaluator: Arc<ConditionEvaluator>,
    pub config: CoreConfig,
}

impl Services {
    /// Wire up the in-memory reference stack
    pub fn in_memory(config: CoreConfig) -> Arc<Self> {
        Arc::new(Services {
            cas: Arc::new(MemoryCas::new()),
            catalog: Arc::new(MemoryCatalog::new()),
            tags: Arc::new(MemoryTagRegistry::new()),
            runs: Arc::new(MemoryRunStore::new()),
            hot: Arc::new(MemoryHotStore::with_status_ttl(
                std::time::Duration::from_secs(config.limits.status_ttl_secs),
            )),
            bus: Arc::new(StreamBus::new()),
            evaluator: Arc::new(ConditionEvaluator::new()),
            config,
        })
    }
}

// ============================================================================
// SHARED DISPATCH HELPERS
// ============================================================================

/// Consume op key for a completion signal
pub(crate) fn consume_key(signal: &CompletionSignal) -> String {
    format!(
        "consume:{}:{}:{}",
        signal.run_id, signal.node_id, signal.job_id
    )
}

/// Load every recorded output of a run into a `ctx` object keyed by node id
pub(crate) async fn run_context(services: &Services, run_id: RunId) -> Result<Value, CoreError> {
    let refs = services.hot.output_refs(run_id).await?;
    let loads = refs.into_iter().map(|(node_id, cas_id)| async move {
        let value = store::get_json(services.cas.as_ref(), &cas_id).await?;
        Ok::<_, CoreError>((node_id, value))
    });
    let ctx: serde_json::Map<String, Value> = future::try_join_all(loads)
        .await?
        .into_iter()
        .collect();
    Ok(Value::Object(ctx))
}

/// Prefetch the outputs a config references, as resolver input
///
/// A referenced node without a recorded output is simply absent here; the
/// resolver surfaces it as `unresolved_reference`.
async fn referenced_outputs(
    services: &Services,
    run_id: RunId,
    config: &Value,
) -> Result<HashMap<String, Arc<Value>>, CoreError> {
    let mut wanted = HashSet::new();
    crate::template::referenced_nodes(config, &mut wanted);

    let loads = wanted.into_iter().map(|node_id| async move {
        match services.hot.output_ref(run_id, &node_id).await? {
            Some(cas_id) => {
                let value = store::get_json(services.cas.as_ref(), &cas_id).await?;
                Ok::<_, CoreError>(Some((node_id, Arc::new(value))))
            }
            None => Ok(None),
        }
    });
    Ok(future::try_join_all(loads)
        .await?
        .into_iter()
        .flatten()
        .collect())
}

/// Emit one successor: join gating, counter protocol, then either worker
/// dispatch or inline absorption
///
/// Returns whether anything was actually scheduled (false on join-not-ready
/// and on op-key replay). Token ids derive from the triggering cause, so a
/// crash-redriven emission replays as a no-op.
pub(crate) async fn emit_to(
    services: &Services,
    run_id: RunId,
    from: Option<&str>,
    to: &IrNode,
    cause: &str,
    hop: u32,
    payload: &Value,
    payload_ref: Option<CasId>,
) -> Result<bool, CoreError> {
    // join gate: emit only once every dependency has a recorded output
    if to.wait_for_all {
        let recorded = services.hot.output_refs(run_id).await?;
        if !to.dependencies.iter().all(|dep| recorded.contains_key(dep)) {
            return Ok(false);
        }
    }

    // join emissions dedupe across emitters: the op key depends only on the
    // target, so whichever dependency completes last (or first, in a race)
    // wins exactly once
    let (token_id, op_key) = if to.wait_for_all {
        let token_id = Token::derive_id(run_id, Some("join"), &to.id, "join");
        (
            token_id.clone(),
            format!("emit:{}:join->{}:{}", run_id, to.id, token_id),
        )
    } else {
        let token_id = Token::derive_id(run_id, from, &to.id, cause);
        (
            token_id.clone(),
            format!(
                "emit:{}:{}->{}:{}",
                run_id,
                from.unwrap_or("start"),
                to.id,
                token_id
            ),
        )
    };

    let outcome = services.hot.apply_counter(run_id, &op_key, 1).await?;
    if !outcome.changed {
        return Ok(false);
    }

    if to.is_absorber() {
        // absorbed inline: no worker involved, the coordinator shapes a
        // synthetic completion carrying the upstream output
        services.bus.publish_signal(CompletionSignal {
            version: SIGNAL_VERSION,
            job_id: token_id,
            run_id,
            node_id: to.id.clone(),
            status: SignalStatus::Completed,
            result_data: Some(payload.clone()),
            result_ref: payload_ref,
            metadata: Some(serde_json::json!({ "hop": hop })),
        });
        return Ok(true);
    }

    let outputs = referenced_outputs(services, run_id, &to.config).await?;
    let config = crate::template::resolve(&to.config, &outputs)?;

    services.bus.publish_task(
        &to.node_type,
        Token {
            id: token_id,
            run_id,
            from_node: from.map(String::from),
            to_node: to.id.clone(),
            payload_ref,
            config,
            hop,
            metadata: Value::Null,
            created_at: Utc::now(),
        },
    );
    Ok(true)
}

/// Emit every routed successor of a completed node in IR order
#[allow(clippy::too_many_arguments)]
pub(crate) async fn emit_successors(
    services: &Services,
    ir: &Ir,
    run_id: RunId,
    from: &IrNode,
    successors: &[String],
    cause: &str,
    hop: u32,
    payload: &Value,
    payload_ref: Option<CasId>,
) -> Result<bool, CoreError> {
    let mut routed_any = false;
    for id in successors {
        let to = ir.node(id).ok_or_else(|| {
            CoreError::other(format!("routed successor '{}' is not in the IR", id))
        })?;
        routed_any |= emit_to(
            services,
            run_id,
            Some(&from.id),
            to,
            cause,
            hop,
            payload,
            payload_ref.clone(),
        )
        .await?;
    }
    Ok(routed_any)
}
