//! AST Module - static workflow structure
//!
//! Contains the parsed document types the compiler and materializer work on:
//! - `workflow`: WorkflowDoc, NodeSpec, EdgeSpec (the versioned base document)
//! - `patch`: PatchOp, OpKind (the JSON Patch subset agents may emit)
//!
//! These types represent the "what" - the declared topology. The compiled,
//! executable form lives in the `ir` module.

mod patch;
mod workflow;

// Re-export all public types
pub use patch::{OpKind, PatchOp, PatchParseError, PATCH_OPS_SCHEMA};
pub use workflow::{
    DocumentError, EdgeSpec, NodeSpec, WorkflowDoc, WORKFLOW_SCHEMA,
};
