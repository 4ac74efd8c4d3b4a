//! Unified error handling with boundary taxonomy codes
//!
//! Each subsystem keeps its own `thiserror` enum close to the code that
//! produces it (compiler, materializer, validator, resolver, evaluator,
//! stores). This module provides the top-level [`CoreError`] the outer
//! surfaces see, plus the stable taxonomy code every boundary error maps
//! to:
//!
//! `not_found`, `conflict`, `invalid_ref`, `no_terminal_nodes`,
//! `materialization_failed`, `patch_validation_failed`,
//! `rate_limit_exceeded`, `unresolved_reference`, `type_error`,
//! `cancelled`.

use thiserror::Error;

use crate::ast::{DocumentError, PatchParseError};
use crate::compiler::CompileError;
use crate::condition::EvalError;
use crate::config::ConfigError;
use crate::limits::RateLimitExceeded;
use crate::materializer::MaterializeError;
use crate::store::StoreError;
use crate::template::ResolveError;
use crate::types::RunId;

/// Stable machine-readable code attached to every boundary error
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// Top-level error for the orchestration core
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Document(#[from] DocumentError),

    #[error("{0}")]
    PatchParse(#[from] PatchParseError),

    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Materialize(#[from] MaterializeError),

    #[error("patch validation failed: {0}")]
    PatchValidation(#[from] crate::validator::PatchValidationError),

    #[error("{0}")]
    Resolve(#[from] ResolveError),

    #[error("{0}")]
    Eval(#[from] EvalError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    RateLimit(#[from] RateLimitExceeded),

    #[error("run {run_id} is cancelled")]
    Cancelled { run_id: RunId },

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn other(msg: impl Into<String>) -> Self {
        CoreError::Other(msg.into())
    }
}

impl ErrorCode for CompileError {
    fn code(&self) -> &'static str {
        match self {
            CompileError::NoTerminalNodes => "no_terminal_nodes",
            _ => "invalid_ref",
        }
    }
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::Conflict { .. } => "conflict",
            StoreError::Unavailable { .. } | StoreError::Corrupt { .. } => "conflict",
        }
    }
}

impl ErrorCode for CoreError {
    fn code(&self) -> &'static str {
        match self {
            CoreError::Document(_) => "invalid_ref",
            CoreError::PatchParse(_) => "patch_validation_failed",
            CoreError::Compile(e) => e.code(),
            CoreError::Materialize(_) => "materialization_failed",
            CoreError::PatchValidation(e) => match e {
                crate::validator::PatchValidationError::Materialize(_) => {
                    "materialization_failed"
                }
                _ => "patch_validation_failed",
            },
            CoreError::Resolve(_) => "unresolved_reference",
            CoreError::Eval(_) => "type_error",
            CoreError::Store(e) => e.code(),
            CoreError::Config(_) => "conflict",
            CoreError::RateLimit(_) => "rate_limit_exceeded",
            CoreError::Cancelled { .. } => "cancelled",
            CoreError::Other(_) => "conflict",
        }
    }
}
