//! # Reweave
//!
//! Core of a distributed workflow orchestration system whose defining
//! capability is safe, runtime self-modification: executing agents emit
//! JSON Patch documents that mutate the running workflow's topology, which
//! are validated, materialized, recompiled and routed through without
//! restarting the run.
//!
//! ## Subsystems
//!
//! | Layer | Module | Responsibility |
//! |-------|--------|----------------|
//! | L1 | [`store`] (cas/catalog/tags/runs) | Content-addressed blobs, typed artifacts, mutable tags, run records |
//! | L2 | [`compiler`], [`materializer`], [`validator`] | Document to IR, patch chain application, three-layer patch safety |
//! | L3 | [`template`], [`condition`], [`runner::router`] | Config resolution, predicate evaluation, successor decisions |
//! | L4 | [`runner::coordinator`], [`store::HotStore`] | Signal loop, atomic counter protocol, termination |
//! | L5 | [`runner::pipeline`], [`limits`] | Runtime patch pipeline, admission control |
//!
//! ## Execution model
//!
//! Choreography, not central driving: control emerges from local routing
//! decisions against shared hot-store state. Coordinator processes are
//! stateless and interchangeable; the only atomicity primitive is the
//! hot store's counter operation, which deduplicates by op key and
//! publishes zero-crossings. Dispatch is at-most-once per op key;
//! completion consumption is idempotent; crash-resume needs nothing but
//! the shared state.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use reweave::{Coordinator, CoreConfig, Services, StatusProjector, Submitter};
//!
//! let services = Services::in_memory(CoreConfig::default());
//! let _coordinator = Coordinator::spawn(services.clone());
//! let _projector = StatusProjector::spawn(services.clone());
//!
//! // seed a dag_version artifact + tag, then:
//! let submitter = Submitter::new(services.clone());
//! let run_id = submitter.submit(request).await?;
//! # Ok::<(), reweave::CoreError>(())
//! ```
//!
//! ## Modules
//!
//! - [`ast`] - workflow documents and JSON Patch operations
//! - [`compiler`] - document to IR (dependencies, joins, terminals, branches)
//! - [`materializer`] - ordered patch chain application
//! - [`validator`] - three-layer patch validation
//! - [`template`] - `$nodes.*` config resolution
//! - [`condition`] - sandboxed predicate expressions with a compiled cache
//! - [`ir`] - the executable representation, tokens, signals, statuses
//! - [`store`] - CAS, catalog, tags, runs, hot store, stream bus
//! - [`runner`] - submit, coordinate, route, patch, project
//! - [`limits`] - rate-limit gates and retry discipline
//! - [`config`] - defaults, YAML overrides, environment overrides
//! - [`error`] - the boundary error taxonomy

pub mod ast;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod error;
pub mod ir;
pub mod jsonpath;
pub mod limits;
pub mod materializer;
pub mod runner;
pub mod store;
pub mod template;
pub mod types;
pub mod validator;

// Re-export the working surface
pub use ast::{EdgeSpec, NodeSpec, OpKind, PatchOp, WorkflowDoc};
pub use compiler::{compile, compile_value, CompileError};
pub use condition::{ConditionEvaluator, EvalError};
pub use config::CoreConfig;
pub use error::{CoreError, ErrorCode};
pub use ir::{
    BranchConfig, BranchRule, CompletionSignal, Condition, Ir, IrNode, LoopConfig, RunStatus,
    SignalStatus, StatusUpdate, Token, EXECUTABLE_TYPES,
};
pub use limits::{RateLimitExceeded, RateLimiter, WorkflowTier};
pub use materializer::{materialize, materialize_bytes, MaterializeError, OrderedPatch};
pub use runner::{
    BaseRef, Coordinator, PatchPipeline, PatchReceipt, PatchSubmission, Services,
    StatusProjector, SubmitRequest, Submitter,
};
pub use store::{
    Artifact, ArtifactCatalog, ArtifactKind, ArtifactSpec, Cas, CounterOutcome, HotStore,
    MemoryCas, MemoryCatalog, MemoryHotStore, MemoryRunStore, MemoryTagRegistry, RunPatch,
    RunRecord, RunStore, StoreError, StreamBus, Tag, TagMove, TagRegistry,
};
pub use types::{ArtifactId, CasId, RunId, TagName, Username};
pub use validator::{PatchValidationError, ValidatedPatch};

/// Initialize env-filtered structured logging (binaries, tests, examples)
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
