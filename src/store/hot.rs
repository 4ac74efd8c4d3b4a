//! Hot store - per-run volatile state and the atomic counter protocol
//!
//! Everything a stateless coordinator needs to resume any run lives behind
//! this trait: the installed IR bytes, the in-flight counter with its
//! applied-op set, recorded output references, loop iteration counters, the
//! latest run status (TTL-bounded), and the patch policy guard.
//!
//! The counter operation is the single atomicity primitive of the whole
//! coordinator: op-key dedup, delta application and the zero-crossing
//! publication happen as one indivisible step, the way a server-side script
//! executes on a production backend. The in-memory implementation gets the
//! same effect by mutating under the run's map entry guard.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::StoreError;
use crate::ir::RunStatus;
use crate::types::{CasId, RunId};

/// Result of one atomic counter operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    /// Counter value after the operation (current value on replay)
    pub value: i64,
    /// False when the op key had already been applied
    pub changed: bool,
    /// True when this operation moved the counter to zero
    pub hit_zero: bool,
}

/// Routing-time re-check state for the patch policy cap
///
/// The installed IR's agent-node count may never exceed
/// `base_agent_nodes + max_agent_adds * applied_patches`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatchGuard {
    pub base_agent_nodes: usize,
    pub applied_patches: u64,
}

/// Default TTL on `run:status:{run_id}`
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-run hot state
#[async_trait]
pub trait HotStore: Send + Sync {
    /// Atomically overwrite `ir:{run_id}`; the next load by any coordinator
    /// sees the new bytes, never a splice
    async fn install_ir(&self, run_id: RunId, bytes: Bytes) -> Result<(), StoreError>;

    async fn load_ir(&self, run_id: RunId) -> Result<Option<Bytes>, StoreError>;

    /// The atomic counter script: dedup by op key, apply delta, publish the
    /// run id on `completion_events` when the counter hits zero
    async fn apply_counter(
        &self,
        run_id: RunId,
        op_key: &str,
        delta: i64,
    ) -> Result<CounterOutcome, StoreError>;

    async fn counter(&self, run_id: RunId) -> Result<i64, StoreError>;

    /// Size of the applied-op set (observability and replay tests)
    async fn applied_len(&self, run_id: RunId) -> Result<usize, StoreError>;

    /// Record `ctx:{run_id}:{node_id}` - the CAS ref of a node's output
    async fn set_output_ref(
        &self,
        run_id: RunId,
        node_id: &str,
        output: &CasId,
    ) -> Result<(), StoreError>;

    async fn output_ref(&self, run_id: RunId, node_id: &str)
        -> Result<Option<CasId>, StoreError>;

    /// All recorded output refs for a run
    async fn output_refs(&self, run_id: RunId) -> Result<HashMap<String, CasId>, StoreError>;

    /// Atomically increment `loop:{run_id}:{node_id}`, returning the new
    /// iteration count (first increment returns 1)
    async fn incr_loop(&self, run_id: RunId, node_id: &str) -> Result<u32, StoreError>;

    async fn loop_iteration(
        &self,
        run_id: RunId,
        node_id: &str,
    ) -> Result<Option<u32>, StoreError>;

    async fn clear_loop(&self, run_id: RunId, node_id: &str) -> Result<(), StoreError>;

    /// Heartbeat `run:status:{run_id}` (TTL-bounded)
    async fn set_status(&self, run_id: RunId, status: RunStatus) -> Result<(), StoreError>;

    async fn status(&self, run_id: RunId) -> Result<Option<RunStatus>, StoreError>;

    async fn set_patch_guard(&self, run_id: RunId, guard: PatchGuard) -> Result<(), StoreError>;

    async fn patch_guard(&self, run_id: RunId) -> Result<Option<PatchGuard>, StoreError>;

    /// Count one applied runtime patch toward the policy guard
    async fn bump_patch_guard(&self, run_id: RunId) -> Result<(), StoreError>;

    /// Destroy a run's hot state (IR, counter, applied set, outputs, loops);
    /// the TTL-bounded status key survives for late observers
    async fn drop_run(&self, run_id: RunId) -> Result<(), StoreError>;

    /// Increment a windowed admission counter (rate limiter buckets)
    async fn incr_window(&self, key: &str) -> Result<u64, StoreError>;

    /// Subscribe to zero-crossing events
    fn completion_events(&self) -> broadcast::Receiver<RunId>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

#[derive(Debug, Default)]
struct RunSlot {
    ir: Option<Bytes>,
    counter: i64,
    applied: HashSet<String>,
    outputs: HashMap<String, CasId>,
    loops: HashMap<String, u32>,
    guard: Option<PatchGuard>,
}

/// In-memory reference implementation
pub struct MemoryHotStore {
    runs: DashMap<RunId, RunSlot>,
    statuses: DashMap<RunId, (RunStatus, Instant)>,
    windows: DashMap<String, u64>,
    status_ttl: Duration,
    events: broadcast::Sender<RunId>,
}

impl Default for MemoryHotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHotStore {
    pub fn new() -> Self {
        Self::with_status_ttl(DEFAULT_STATUS_TTL)
    }

    pub fn with_status_ttl(status_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        MemoryHotStore {
            runs: DashMap::new(),
            statuses: DashMap::new(),
            windows: DashMap::new(),
            status_ttl,
            events,
        }
    }
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn install_ir(&self, run_id: RunId, bytes: Bytes) -> Result<(), StoreError> {
        self.runs.entry(run_id).or_default().ir = Some(bytes);
        Ok(())
    }

    async fn load_ir(&self, run_id: RunId) -> Result<Option<Bytes>, StoreError> {
        Ok(self.runs.get(&run_id).and_then(|slot| slot.ir.clone()))
    }

    async fn apply_counter(
        &self,
        run_id: RunId,
        op_key: &str,
        delta: i64,
    ) -> Result<CounterOutcome, StoreError> {
        // the entry guard is the atomic section
        let mut slot = self.runs.entry(run_id).or_default();
        if slot.applied.contains(op_key) {
            return Ok(CounterOutcome {
                value: slot.counter,
                changed: false,
                hit_zero: false,
            });
        }
        slot.applied.insert(op_key.to_string());
        slot.counter += delta;
        let outcome = CounterOutcome {
            value: slot.counter,
            changed: true,
            hit_zero: slot.counter == 0,
        };
        drop(slot);

        if outcome.hit_zero {
            // nobody listening is fine
            let _ = self.events.send(run_id);
        }
        Ok(outcome)
    }

    async fn counter(&self, run_id: RunId) -> Result<i64, StoreError> {
        Ok(self.runs.get(&run_id).map(|s| s.counter).unwrap_or(0))
    }

    async fn applied_len(&self, run_id: RunId) -> Result<usize, StoreError> {
        Ok(self.runs.get(&run_id).map(|s| s.applied.len()).unwrap_or(0))
    }

    async fn set_output_ref(
        &self,
        run_id: RunId,
        node_id: &str,
        output: &CasId,
    ) -> Result<(), StoreError> {
        self.runs
            .entry(run_id)
            .or_default()
            .outputs
            .insert(node_id.to_string(), output.clone());
        Ok(())
    }

    async fn output_ref(
        &self,
        run_id: RunId,
        node_id: &str,
    ) -> Result<Option<CasId>, StoreError> {
        Ok(self
            .runs
            .get(&run_id)
            .and_then(|s| s.outputs.get(node_id).cloned()))
    }

    async fn output_refs(&self, run_id: RunId) -> Result<HashMap<String, CasId>, StoreError> {
        Ok(self
            .runs
            .get(&run_id)
            .map(|s| s.outputs.clone())
            .unwrap_or_default())
    }

    async fn incr_loop(&self, run_id: RunId, node_id: &str) -> Result<u32, StoreError> {
        let mut slot = self.runs.entry(run_id).or_default();
        let count = slot.loops.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn loop_iteration(
        &self,
        run_id: RunId,
        node_id: &str,
    ) -> Result<Option<u32>, StoreError> {
        Ok(self.runs.get(&run_id).and_then(|s| s.loops.get(node_id).copied()))
    }

    async fn clear_loop(&self, run_id: RunId, node_id: &str) -> Result<(), StoreError> {
        if let Some(mut slot) = self.runs.get_mut(&run_id) {
            slot.loops.remove(node_id);
        }
        Ok(())
    }

    async fn set_status(&self, run_id: RunId, status: RunStatus) -> Result<(), StoreError> {
        self.statuses
            .insert(run_id, (status, Instant::now() + self.status_ttl));
        Ok(())
    }

    async fn status(&self, run_id: RunId) -> Result<Option<RunStatus>, StoreError> {
        match self.statuses.get(&run_id) {
            Some(entry) => {
                let (status, expires) = *entry;
                drop(entry);
                if Instant::now() >= expires {
                    self.statuses.remove(&run_id);
                    Ok(None)
                } else {
                    Ok(Some(status))
                }
            }
            None => Ok(None),
        }
    }

    async fn set_patch_guard(&self, run_id: RunId, guard: PatchGuard) -> Result<(), StoreError> {
        self.runs.entry(run_id).or_default().guard = Some(guard);
        Ok(())
    }

    async fn patch_guard(&self, run_id: RunId) -> Result<Option<PatchGuard>, StoreError> {
        Ok(self.runs.get(&run_id).and_then(|s| s.guard))
    }

    async fn bump_patch_guard(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut slot = self.runs.entry(run_id).or_default();
        let guard = slot.guard.get_or_insert_with(PatchGuard::default);
        guard.applied_patches += 1;
        Ok(())
    }

    async fn drop_run(&self, run_id: RunId) -> Result<(), StoreError> {
        self.runs.remove(&run_id);
        Ok(())
    }

    async fn incr_window(&self, key: &str) -> Result<u64, StoreError> {
        let mut count = self.windows.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    fn completion_events(&self) -> broadcast::Receiver<RunId> {
        self.events.subscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================
