//! # coworker-daemon
//!
//! The coworker filesystem server: a loopback HTTP daemon that accepts
//! typed job requests from a browser-extension UI and executes them
//! against an allowlisted set of workspace roots, behind a
//! plan → approve → execute safety gate.
//!
//! ## Architecture
//!
//! - [`store`]: the `SQLite` control plane (sessions, jobs, results,
//!   approvals) with single-writer transactional semantics.
//! - [`gateway`]: the axum HTTP surface for handshake, job submission,
//!   status polling, result retrieval, and approval minting.
//! - [`worker`]: the pool of lease-holding executors dispatching into
//!   the tool registry.
//! - [`session`]: token minting for sessions and approvals.
//! - [`config`]: resolved server configuration.
//!
//! Control flow: UI → gateway → store (enqueue) → worker
//! (claim + execute) → store (result) + workspace audit log.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod gateway;
pub mod session;
pub mod store;
pub mod worker;

pub use config::ServerConfig;
pub use gateway::{ApiError, GatewayState};
pub use store::{now_ms, Approval, CpStore, Job, JobOutcome, JobStatus, StoreError};
pub use worker::WorkerPool;
