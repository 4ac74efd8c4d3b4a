//! Coordinator - the completion-signal loop
//!
//! Consumes `completion_signals`, applies the consume delta through the
//! atomic counter, records the node's output reference, routes successors
//! and emits their tokens. Multiple coordinators (tasks or processes) can
//! run concurrently: every step is either idempotent under an op key or a
//! plain read of shared hot state, so a crash mid-routing is recovered by
//! whichever coordinator sees the redelivered signal next.
//!
//! Termination: a run is COMPLETED when a terminal node completes, the
//! counter is at zero, and the routing decision scheduled nothing new.
//! Worker failures without a configured break/branch path FAIL the run.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{consume_key, emit_successors, pipeline, router, run_context, Services};
use crate::error::CoreError;
use crate::ir::{CompletionSignal, Ir, RunStatus, SignalStatus, StatusUpdate};
use crate::limits::with_retries;
use crate::store::{self, media_type, HotStore, RunStore};
use crate::types::{CasId, RunId};

/// Stateless signal-routing worker
pub struct Coordinator {
    services: Arc<Services>,
}

impl Coordinator {
    pub fn new(services: Arc<Services>) -> Self {
        Coordinator { services }
    }

    /// Spawn a coordinator task; abort the handle to stop it
    pub fn spawn(services: Arc<Services>) -> tokio::task::JoinHandle<()> {
        let coordinator = Coordinator::new(services);
        tokio::spawn(async move { coordinator.run_loop().await })
    }

    /// Block on the completion queue until the bus goes away
    pub async fn run_loop(&self) {
        let signals = self.services.bus.completion_signals();
        while let Some(signal) = signals.recv().await {
            let run_id = signal.run_id;
            let node_id = signal.node_id.clone();
            if let Err(e) = self.handle_signal(signal).await {
                error!(run = %run_id, node = %node_id, error = %e,
                       "signal handling failed");
            }
        }
    }

    /// Process one completion signal end to end
    pub async fn handle_signal(&self, signal: CompletionSignal) -> Result<(), CoreError> {
        let services = &self.services;
        let run_id = signal.run_id;

        // consume first: replayed signals are absorbed here, and drained
        // signals for terminated runs still keep the counter honest
        let key = consume_key(&signal);
        let consume = with_retries("consume", &services.config.retry, || {
            services.hot.apply_counter(run_id, &key, -1)
        })
        .await?;

        let known_status = match services.hot.status(run_id).await? {
            Some(status) => Some(status),
            None => services.runs.get(run_id).await.ok().map(|r| r.status),
        };
        if let Some(status) = known_status {
            if status.is_terminal() {
                debug!(run = %run_id, node = %signal.node_id, %status,
                       "draining signal for terminated run");
                return Ok(());
            }
        }

        let ir = match self.load_or_recover_ir(run_id).await {
            Ok(ir) => ir,
            Err(e) => {
                error!(run = %run_id, error = %e, "IR unrecoverable, failing run");
                self.finish_run(run_id, RunStatus::Failed).await?;
                return Ok(());
            }
        };

        let node = match ir.node(&signal.node_id) {
            Some(node) => node.clone(),
            None => {
                error!(run = %run_id, node = %signal.node_id,
                       "completed node is not in the installed IR, failing run");
                self.finish_run(run_id, RunStatus::Failed).await?;
                return Ok(());
            }
        };

        // routing-time re-check of the patch policy cap
        if let Some(guard) = services.hot.patch_guard(run_id).await? {
            let allowed = guard.base_agent_nodes
                + services.config.limits.max_agent_adds_per_patch
                    * guard.applied_patches as usize;
            if ir.agent_node_count() > allowed {
                error!(run = %run_id, agents = ir.agent_node_count(), allowed,
                       "agent-node policy violated in installed IR, failing run");
                self.finish_run(run_id, RunStatus::Failed).await?;
                return Ok(());
            }
        }

        // record the output, then load the run context. Either can fail -
        // `result_ref` is worker-supplied wire data and may point at a blob
        // that was never stored - and a load failure must degrade the route
        // rather than wedge the run.
        let loaded = match self.record_output(&signal).await {
            Ok((value, output_ref)) => match run_context(services, run_id).await {
                Ok(ctx) => Ok((value, output_ref, ctx)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let (decision, output_value, output_ref) = match loaded {
            Ok((output_value, output_ref, ctx)) => {
                let decision = router::route(
                    services.hot.as_ref(),
                    services.evaluator.as_ref(),
                    run_id,
                    &node,
                    signal.status,
                    &output_value,
                    &ctx,
                )
                .await?;
                (decision, output_value, Some(output_ref))
            }
            // load/context errors: a loop breaks (same as a condition
            // error), a branch falls through to its default, anything else
            // is unrecoverable
            Err(e) => {
                warn!(run = %run_id, node = %node.id, error = %e,
                      "output/context load failed, degrading route");
                let decision = if let Some(lc) = &node.loop_config {
                    if let Err(e) = services.hot.clear_loop(run_id, &node.id).await {
                        warn!(run = %run_id, node = %node.id, error = %e,
                              "loop counter clear failed");
                    }
                    router::RouteDecision::Next(lc.break_path.clone())
                } else if let Some(branch) = &node.branch {
                    router::RouteDecision::Next(branch.default.clone())
                } else {
                    router::RouteDecision::FailRun
                };
                (decision, Value::Null, None)
            }
        };

        let successors = match decision {
            router::RouteDecision::FailRun => {
                warn!(run = %run_id, node = %node.id, "unroutable completion");
                self.finish_run(run_id, RunStatus::Failed).await?;
                return Ok(());
            }
            router::RouteDecision::Next(successors) => successors,
        };

        let hop = signal
            .metadata
            .as_ref()
            .and_then(|m| m.get("hop"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let routed_any = match emit_successors(
            services,
            &ir,
            run_id,
            &node,
            &successors,
            &signal.job_id,
            hop + 1,
            &output_value,
            output_ref,
        )
        .await
        {
            Ok(routed_any) => routed_any,
            Err(e) => {
                // config resolution and emission failures are not
                // recoverable by redelivery
                error!(run = %run_id, node = %node.id, error = %e,
                       "successor emission failed, failing run");
                self.finish_run(run_id, RunStatus::Failed).await?;
                return Ok(());
            }
        };

        // zero at consume time (or observed now, for a redriven consume)
        let at_zero =
            consume.hit_zero || (!consume.changed && services.hot.counter(run_id).await? == 0);

        if node.is_terminal
            && signal.status == SignalStatus::Completed
            && at_zero
            && !routed_any
        {
            self.finish_run(run_id, RunStatus::Completed).await?;
            return Ok(());
        }

        // heartbeat; a dispatched human-approval task parks the run
        let waiting = routed_any
            && successors
                .iter()
                .filter_map(|id| ir.node(id))
                .any(|n| n.node_type == "hitl");
        let heartbeat = if waiting {
            RunStatus::WaitingForApproval
        } else {
            RunStatus::Running
        };
        services.hot.set_status(run_id, heartbeat).await?;
        if waiting {
            services
                .bus
                .publish_status(StatusUpdate::now(run_id, heartbeat));
        }

        Ok(())
    }

    /// Resolve the signal's output value and make sure its CAS ref is
    /// recorded under `ctx:{run}:{node}`
    ///
    /// A worker-supplied `result_ref` is fetched (it may be stale or
    /// garbage); an inline payload is persisted. Both sides and the ref
    /// write go through the local retry discipline, so only a
    /// non-transient failure surfaces.
    async fn record_output(
        &self,
        signal: &CompletionSignal,
    ) -> Result<(Value, CasId), CoreError> {
        let services = &self.services;
        let run_id = signal.run_id;

        let (value, output_ref) = match (&signal.result_ref, &signal.result_data) {
            (Some(r), _) => {
                let value = with_retries("load_output", &services.config.retry, || {
                    store::get_json(services.cas.as_ref(), r)
                })
                .await?;
                (value, r.clone())
            }
            (None, data) => {
                let value = data.clone().unwrap_or(Value::Null);
                let output_ref = with_retries("persist_output", &services.config.retry, || {
                    store::put_json(services.cas.as_ref(), &value, media_type::NODE_OUTPUT)
                })
                .await?;
                (value, output_ref)
            }
        };

        with_retries("record_output_ref", &services.config.retry, || {
            services.hot.set_output_ref(run_id, &signal.node_id, &output_ref)
        })
        .await?;
        Ok((value, output_ref))
    }

    /// Load the installed IR, rebuilding it from durable state on a cold
    /// hot cache
    async fn load_or_recover_ir(&self, run_id: RunId) -> Result<Ir, CoreError> {
        let services = &self.services;
        let cached = with_retries("load_ir", &services.config.retry, || {
            services.hot.load_ir(run_id)
        })
        .await?;
        if let Some(bytes) = cached {
            return Ir::from_slice(&bytes)
                .map_err(|e| CoreError::other(format!("installed IR is unreadable: {}", e)));
        }

        let record = services.runs.get(run_id).await?;
        let chain = pipeline::materialize_run_doc(services, &record).await?;
        let ir = crate::compiler::compile_value(&chain.doc)?;
        services
            .hot
            .install_ir(run_id, Bytes::from(ir.to_bytes()))
            .await?;
        warn!(run = %run_id, "IR rebuilt from catalog into the hot cache");
        Ok(ir)
    }

    /// Publish a terminal status and destroy the run's hot state
    async fn finish_run(&self, run_id: RunId, status: RunStatus) -> Result<(), CoreError> {
        let services = &self.services;
        services.hot.set_status(run_id, status).await?;
        services
            .bus
            .publish_status(StatusUpdate::now(run_id, status));
        services.hot.drop_run(run_id).await?;
        info!(run = %run_id, %status, "run finished");
        Ok(())
    }
}
