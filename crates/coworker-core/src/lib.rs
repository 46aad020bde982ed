//! # coworker-core
//!
//! Core library for the coworker filesystem server, a local-first daemon
//! that executes typed jobs against an allowlisted set of workspace roots
//! on behalf of a browser-extension UI.
//!
//! This crate holds everything below the orchestration runtime:
//!
//! - **Tool registry**: the static catalog of tool descriptors (wire-stable
//!   numeric ids, parameter schemas, result MIME types, and the explicit
//!   mutating bit that gates approval enforcement).
//! - **Tool handlers**: in-process implementations of the filesystem tool
//!   suite (scan, list, read, organize plan, execute plan, soft delete,
//!   restore) plus audit-log search. Tools the server does not host are
//!   still described in the registry so the gateway can validate and list
//!   them.
//! - **Workspace scoping**: canonical path resolution and prefix-descendant
//!   containment checks against the workspace allowlist.
//! - **Plan hashing**: SHA-256 commitments over canonical plan bytes, the
//!   anchor of the plan → approve → execute gate.
//! - **Audit log**: the append-only JSONL record of every mutation, anchored
//!   inside each workspace root.
//!
//! The daemon crate (`coworker-daemon`) layers the durable store, the HTTP
//! gateway, and the worker pool on top of these primitives.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod plan;
pub mod scope;
pub mod tool;

pub use audit::{AuditEntry, AuditError, AuditLog, AUDIT_FILE_NAME};
pub use plan::{hashes_equal, sha256_hex, OrganizePlan, PlanMove};
pub use scope::{ScopeError, WorkspaceScope};
pub use tool::{
    descriptor, descriptors, JobParams, ToolContext, ToolDescriptor, ToolError, ToolHandler,
    ToolId, ToolOutput, ToolSet,
};
