//! `SQLite`-backed control-plane store.
//!
//! The store owns every mutable row in the system: sessions, jobs,
//! results, and approvals. It is the single shared resource between the
//! gateway and the worker pool, and it serializes writers internally:
//! every mutating operation runs inside one short-lived immediate
//! transaction on the shared connection, so two workers racing for the
//! same job observe a strict winner.
//!
//! # Consistency contract
//!
//! - A job's dedupe key is unique over non-terminal rows; submission is
//!   idempotent while a matching job is live.
//! - Status only moves forward: `QUEUED → RUNNING → SUCCEEDED/FAILED`
//!   (or `QUEUED → FAILED` for rejected-before-execution). Nothing
//!   leaves a terminal state.
//! - The result row is written in the same transaction that flips the
//!   job to `SUCCEEDED`; a reader can never observe the status without
//!   the result.
//! - Lease columns are non-null exactly while the job is `RUNNING`.
//! - Approvals are single-use: consumption deletes the row atomically.

// SQLite stores integers as i64; timestamps and sizes here are always
// non-negative and far below the overflow horizon.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use coworker_core::tool::{JobParams, ToolId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::session;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors from control-plane store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Params or roots column failed to (de)serialize.
    #[error("row serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("store connection lock poisoned")]
    LockPoisoned,

    /// A job row carries a type id outside the registry.
    #[error("unknown tool type id: {type_id}")]
    UnknownToolType {
        /// The unrecognized wire id.
        type_id: i64,
    },

    /// A mutating tool was submitted without an approval token.
    #[error("approval token required for mutating tool {tool}")]
    ApprovalRequired {
        /// Registry name of the tool.
        tool: &'static str,
    },

    /// The caller no longer owns the job's lease.
    #[error("lease preempted for job {job_id}")]
    Preempted {
        /// The contested job.
        job_id: String,
    },

    /// The referenced plan job does not exist (or has no result).
    #[error("plan job not found: {plan_job_id}")]
    PlanNotFound {
        /// The missing plan job id.
        plan_job_id: String,
    },

    /// The referenced plan job has not succeeded.
    #[error("plan job {plan_job_id} is not in SUCCEEDED state")]
    PlanNotSucceeded {
        /// The plan job id.
        plan_job_id: String,
    },

    /// The supplied plan hash does not match the stored result bytes.
    #[error("plan hash mismatch for plan job {plan_job_id}")]
    PlanHashMismatch {
        /// The plan job id.
        plan_job_id: String,
    },

    /// No approval row exists for the token.
    #[error("unknown approval token")]
    ApprovalUnknown,

    /// The approval's TTL elapsed before consumption.
    #[error("approval token expired")]
    ApprovalExpired,

    /// The approval is bound to a different plan job.
    #[error("approval token bound to plan {bound}, not {expected}")]
    ApprovalMismatch {
        /// Plan the token commits to.
        bound: String,
        /// Plan the execute job references.
        expected: String,
    },
}

/// Job lifecycle states; numeric codes are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Accepted, waiting for a worker.
    Queued = 1,
    /// Claimed under a live lease.
    Running = 2,
    /// Finished with a result row.
    Succeeded = 3,
    /// Finished with an error message.
    Failed = 4,
}

impl JobStatus {
    /// The numeric wire code.
    #[must_use]
    pub const fn wire_code(self) -> i64 {
        self as i64
    }

    /// Parses a stored status code.
    #[must_use]
    pub const fn from_wire(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Queued),
            2 => Some(Self::Running),
            3 => Some(Self::Succeeded),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A job row.
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque job identifier.
    pub job_id: String,
    /// Caller-supplied idempotency key.
    pub dedupe_key: String,
    /// The tool this job runs.
    pub tool: ToolId,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Submission time.
    pub created_at_ms: u64,
    /// First claim time, if ever claimed.
    pub started_at_ms: Option<u64>,
    /// Terminal transition time.
    pub finished_at_ms: Option<u64>,
    /// Failure message for `FAILED` jobs.
    pub error_message: Option<String>,
    /// Parameters as submitted.
    pub params: JobParams,
    /// Canonical workspace roots this job may touch.
    pub allowed_roots: Vec<String>,
    /// Current lease holder, while `RUNNING`.
    pub lease_owner: Option<String>,
    /// Lease expiry, while `RUNNING`.
    pub lease_expires_at_ms: Option<u64>,
    /// Approval token carried by mutating jobs.
    pub approval_token: Option<String>,
}

/// An approval row: a single-use commitment to a plan's content hash.
#[derive(Debug, Clone)]
pub struct Approval {
    /// The secret token.
    pub token: String,
    /// The plan job this approval is bound to.
    pub plan_job_id: String,
    /// Hex SHA-256 over the plan's stored result bytes at mint time.
    pub plan_hash: String,
    /// Expiry judged against the server clock at consume time.
    pub expires_at_ms: u64,
    /// Mint time.
    pub created_at_ms: u64,
}

/// Terminal outcome of a job execution.
#[derive(Debug)]
pub enum JobOutcome {
    /// Tool returned bytes; a result row is written atomically.
    Succeeded {
        /// Result payload.
        bytes: Vec<u8>,
        /// MIME type of the payload.
        content_type: String,
    },
    /// Tool (or the approval gate) failed.
    Failed {
        /// Human-readable failure description.
        error: String,
    },
}

/// The control-plane store handle; cheap to clone.
#[derive(Clone)]
pub struct CpStore {
    conn: Arc<Mutex<Connection>>,
}

impl CpStore {
    /// Opens or creates the store at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or
    /// initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if initialization fails.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // -------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------

    /// Mints and persists a fresh session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on insert failure.
    pub fn create_session(&self, now_ms: u64) -> Result<(String, String), StoreError> {
        let session_id = session::mint_session_id();
        let token = session::mint_token();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (session_id, token, created_at_ms) VALUES (?1, ?2, ?3)",
            params![session_id, token, now_ms],
        )?;
        Ok((session_id, token))
    }

    /// Validates a session credential pair.
    ///
    /// The token comparison is timing-uniform: both sides are hashed and
    /// the digests compared in constant time, so neither a missing row's
    /// shape nor a shared prefix leaks through latency.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on read failure.
    pub fn authenticate(&self, session_id: &str, token: &str) -> Result<bool, StoreError> {
        if session_id.is_empty() || token.is_empty() {
            return Ok(false);
        }
        let stored: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT token FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
        };
        let Some(stored) = stored else {
            return Ok(false);
        };
        let expected = Sha256::digest(stored.as_bytes());
        let provided = Sha256::digest(token.as_bytes());
        Ok(bool::from(expected.as_slice().ct_eq(provided.as_slice())))
    }

    // -------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------

    /// Submits a job, coalescing onto any live job with the same dedupe
    /// key. Returns the job id and whether a new row was created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ApprovalRequired`] for a mutating tool
    /// without a token, and [`StoreError::Database`] on write failure.
    pub fn submit_job(
        &self,
        dedupe_key: &str,
        tool: ToolId,
        allowed_roots: &[String],
        job_params: &JobParams,
        approval_token: Option<&str>,
        now_ms: u64,
    ) -> Result<(String, bool), StoreError> {
        let descriptor = tool.descriptor();
        if descriptor.mutating && approval_token.is_none() {
            return Err(StoreError::ApprovalRequired {
                tool: descriptor.name,
            });
        }

        let params_json = serde_json::to_string(job_params)?;
        let roots_json = serde_json::to_string(allowed_roots)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT job_id FROM jobs WHERE dedupe_key = ?1 AND status IN (?2, ?3) LIMIT 1",
                params![
                    dedupe_key,
                    JobStatus::Queued.wire_code(),
                    JobStatus::Running.wire_code()
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(job_id) = existing {
            tx.commit()?;
            return Ok((job_id, false));
        }

        let job_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO jobs (job_id, dedupe_key, type, status, created_at_ms, params_json, allowed_roots_json, approval_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job_id,
                dedupe_key,
                tool.wire_id(),
                JobStatus::Queued.wire_code(),
                now_ms,
                params_json,
                roots_json,
                approval_token,
            ],
        )?;
        tx.commit()?;
        Ok((job_id, true))
    }

    /// Claims the next eligible job for `worker_id` under a fresh lease.
    ///
    /// Eligible rows are `QUEUED` jobs in FIFO order (tie-broken by
    /// `job_id`) and `RUNNING` jobs whose lease expired before `now_ms`
    /// (crash reclaim). At most one worker wins a given row; the select
    /// and update happen in one immediate transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on transaction failure.
    pub fn claim_next_job(
        &self,
        worker_id: &str,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<Option<Job>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT job_id, dedupe_key, type, status, created_at_ms, started_at_ms,
                        finished_at_ms, error_message, params_json, allowed_roots_json,
                        lease_owner, lease_expires_at_ms, approval_token
                 FROM jobs
                 WHERE status = ?1
                    OR (status = ?2 AND lease_expires_at_ms IS NOT NULL AND lease_expires_at_ms < ?3)
                 ORDER BY created_at_ms ASC, job_id ASC
                 LIMIT 1",
                params![
                    JobStatus::Queued.wire_code(),
                    JobStatus::Running.wire_code(),
                    now_ms
                ],
                RawJob::from_row,
            )
            .optional()?;

        let Some(raw) = row else {
            return Ok(None);
        };
        let mut job = raw.into_job()?;

        let expires = now_ms + lease_ms;
        tx.execute(
            "UPDATE jobs
             SET status = ?1,
                 started_at_ms = COALESCE(started_at_ms, ?2),
                 lease_owner = ?3,
                 lease_expires_at_ms = ?4
             WHERE job_id = ?5",
            params![
                JobStatus::Running.wire_code(),
                now_ms,
                worker_id,
                expires,
                job.job_id
            ],
        )?;
        tx.commit()?;

        job.status = JobStatus::Running;
        job.started_at_ms = Some(job.started_at_ms.unwrap_or(now_ms));
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at_ms = Some(expires);
        Ok(Some(job))
    }

    /// Extends the lease for a job the worker still owns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Preempted`] when the worker no longer owns a
    /// `RUNNING` row for the job.
    pub fn renew_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<(), StoreError> {
        let updated = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE jobs SET lease_expires_at_ms = ?1
                 WHERE job_id = ?2 AND lease_owner = ?3 AND status = ?4",
                params![
                    now_ms + lease_ms,
                    job_id,
                    worker_id,
                    JobStatus::Running.wire_code()
                ],
            )?
        };
        if updated == 0 {
            return Err(StoreError::Preempted {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Records a job's terminal outcome, owner-checked.
    ///
    /// For a succeeded job the result row is written in the same
    /// transaction as the status flip. If the lease was reclaimed the
    /// update is rejected and the caller must discard its result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Preempted`] on owner mismatch and
    /// [`StoreError::Database`] on write failure.
    pub fn complete_job(
        &self,
        job_id: &str,
        worker_id: &str,
        now_ms: u64,
        outcome: &JobOutcome,
    ) -> Result<(), StoreError> {
        let (status, error_message) = match outcome {
            JobOutcome::Succeeded { .. } => (JobStatus::Succeeded, None),
            JobOutcome::Failed { error } => (JobStatus::Failed, Some(error.as_str())),
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE jobs
             SET status = ?1, finished_at_ms = ?2, error_message = ?3,
                 lease_owner = NULL, lease_expires_at_ms = NULL
             WHERE job_id = ?4 AND lease_owner = ?5 AND status = ?6",
            params![
                status.wire_code(),
                now_ms,
                error_message,
                job_id,
                worker_id,
                JobStatus::Running.wire_code()
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::Preempted {
                job_id: job_id.to_string(),
            });
        }

        if let JobOutcome::Succeeded {
            bytes,
            content_type,
        } = outcome
        {
            tx.execute(
                "INSERT OR REPLACE INTO results (job_id, result_bytes, content_type, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job_id, bytes, content_type, now_ms],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads one job row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on read failure.
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT job_id, dedupe_key, type, status, created_at_ms, started_at_ms,
                        finished_at_ms, error_message, params_json, allowed_roots_json,
                        lease_owner, lease_expires_at_ms, approval_token
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                RawJob::from_row,
            )
            .optional()?
        };
        raw.map(RawJob::into_job).transpose()
    }

    /// Reads a job's result payload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on read failure.
    pub fn get_result(&self, job_id: &str) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT result_bytes, content_type FROM results WHERE job_id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(StoreError::from)
    }

    // -------------------------------------------------------------------
    // Approvals
    // -------------------------------------------------------------------

    /// Mints an approval bound to a succeeded plan job's result hash.
    ///
    /// The hash is recomputed over the stored result bytes and must match
    /// the caller's `plan_hash`; this pins the approval to exactly the
    /// bytes the caller reviewed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PlanNotFound`], [`StoreError::PlanNotSucceeded`],
    /// or [`StoreError::PlanHashMismatch`] per the mint contract.
    pub fn mint_approval(
        &self,
        plan_job_id: &str,
        plan_hash: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Approval, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<i64> = tx
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![plan_job_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(StoreError::PlanNotFound {
                plan_job_id: plan_job_id.to_string(),
            });
        };
        if JobStatus::from_wire(status) != Some(JobStatus::Succeeded) {
            return Err(StoreError::PlanNotSucceeded {
                plan_job_id: plan_job_id.to_string(),
            });
        }

        let result_bytes: Option<Vec<u8>> = tx
            .query_row(
                "SELECT result_bytes FROM results WHERE job_id = ?1",
                params![plan_job_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(result_bytes) = result_bytes else {
            return Err(StoreError::PlanNotFound {
                plan_job_id: plan_job_id.to_string(),
            });
        };

        let recomputed = coworker_core::plan::sha256_hex(&result_bytes);
        if !coworker_core::plan::hashes_equal(&recomputed, plan_hash) {
            return Err(StoreError::PlanHashMismatch {
                plan_job_id: plan_job_id.to_string(),
            });
        }

        let approval = Approval {
            token: session::mint_token(),
            plan_job_id: plan_job_id.to_string(),
            plan_hash: recomputed,
            expires_at_ms: now_ms + ttl_ms,
            created_at_ms: now_ms,
        };
        tx.execute(
            "INSERT INTO approvals (token, plan_job_id, plan_hash, expires_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                approval.token,
                approval.plan_job_id,
                approval.plan_hash,
                approval.expires_at_ms,
                approval.created_at_ms
            ],
        )?;
        tx.commit()?;
        Ok(approval)
    }

    /// Consumes an approval token, single-use.
    ///
    /// When `expected_plan_job_id` is given (execute-plan jobs declare
    /// the plan they act on), the token must be bound to that plan. On
    /// success the row is deleted in the same transaction; a replayed
    /// token is `Unknown`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ApprovalUnknown`], [`StoreError::ApprovalExpired`],
    /// or [`StoreError::ApprovalMismatch`] per the consume contract.
    pub fn consume_approval(
        &self,
        token: &str,
        expected_plan_job_id: Option<&str>,
        now_ms: u64,
    ) -> Result<Approval, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(String, String, u64, u64)> = tx
            .query_row(
                "SELECT plan_job_id, plan_hash, expires_at_ms, created_at_ms
                 FROM approvals WHERE token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((plan_job_id, plan_hash, expires_at_ms, created_at_ms)) = row else {
            return Err(StoreError::ApprovalUnknown);
        };

        if expires_at_ms <= now_ms {
            // Expired tokens are swept on sight; they can never be spent.
            tx.execute("DELETE FROM approvals WHERE token = ?1", params![token])?;
            tx.commit()?;
            return Err(StoreError::ApprovalExpired);
        }

        if let Some(expected) = expected_plan_job_id {
            if expected != plan_job_id {
                // Not consumed: the token stays bound to its own plan.
                return Err(StoreError::ApprovalMismatch {
                    bound: plan_job_id,
                    expected: expected.to_string(),
                });
            }
        }

        tx.execute("DELETE FROM approvals WHERE token = ?1", params![token])?;
        tx.commit()?;
        Ok(Approval {
            token: token.to_string(),
            plan_job_id,
            plan_hash,
            expires_at_ms,
            created_at_ms,
        })
    }

    /// Deletes approvals whose TTL elapsed; returns how many were swept.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub fn purge_expired_approvals(&self, now_ms: u64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM approvals WHERE expires_at_ms <= ?1",
            params![now_ms],
        )?;
        Ok(deleted)
    }
}

/// Row image before JSON columns are parsed.
struct RawJob {
    job_id: String,
    dedupe_key: String,
    type_id: i64,
    status: i64,
    created_at_ms: u64,
    started_at_ms: Option<u64>,
    finished_at_ms: Option<u64>,
    error_message: Option<String>,
    params_json: String,
    allowed_roots_json: String,
    lease_owner: Option<String>,
    lease_expires_at_ms: Option<u64>,
    approval_token: Option<String>,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            dedupe_key: row.get(1)?,
            type_id: row.get(2)?,
            status: row.get(3)?,
            created_at_ms: row.get(4)?,
            started_at_ms: row.get(5)?,
            finished_at_ms: row.get(6)?,
            error_message: row.get(7)?,
            params_json: row.get(8)?,
            allowed_roots_json: row.get(9)?,
            lease_owner: row.get(10)?,
            lease_expires_at_ms: row.get(11)?,
            approval_token: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let tool = ToolId::from_wire(self.type_id).ok_or(StoreError::UnknownToolType {
            type_id: self.type_id,
        })?;
        let status = JobStatus::from_wire(self.status).ok_or_else(|| {
            StoreError::Database(rusqlite::Error::IntegralValueOutOfRange(
                3,
                self.status,
            ))
        })?;
        let params: BTreeMap<String, String> = serde_json::from_str(&self.params_json)?;
        let allowed_roots: Vec<String> = serde_json::from_str(&self.allowed_roots_json)?;
        Ok(Job {
            job_id: self.job_id,
            dedupe_key: self.dedupe_key,
            tool,
            status,
            created_at_ms: self.created_at_ms,
            started_at_ms: self.started_at_ms,
            finished_at_ms: self.finished_at_ms,
            error_message: self.error_message,
            params,
            allowed_roots,
            lease_owner: self.lease_owner,
            lease_expires_at_ms: self.lease_expires_at_ms,
            approval_token: self.approval_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000;
    const LEASE: u64 = 30_000;

    fn store() -> CpStore {
        CpStore::in_memory().unwrap()
    }

    fn no_params() -> JobParams {
        JobParams::new()
    }

    fn roots() -> Vec<String> {
        vec!["/w".to_string()]
    }

    fn submit_scan(store: &CpStore, key: &str, at: u64) -> String {
        let (job_id, created) = store
            .submit_job(key, ToolId::ScanIndex, &roots(), &no_params(), None, at)
            .unwrap();
        assert!(created);
        job_id
    }

    // ---------------- sessions ----------------

    #[test]
    fn session_roundtrip_and_auth() {
        let store = store();
        let (sid, token) = store.create_session(T0).unwrap();
        assert!(token.len() >= 40);

        assert!(store.authenticate(&sid, &token).unwrap());
        assert!(!store.authenticate(&sid, "wrong").unwrap());
        assert!(!store.authenticate("missing", &token).unwrap());
        assert!(!store.authenticate("", "").unwrap());
    }

    #[test]
    fn minted_tokens_are_unique() {
        let store = store();
        let (s1, t1) = store.create_session(T0).unwrap();
        let (s2, t2) = store.create_session(T0).unwrap();
        assert_ne!(s1, s2);
        assert_ne!(t1, t2);
    }

    // ---------------- submission ----------------

    #[test]
    fn submit_is_idempotent_while_live() {
        let store = store();
        let first = submit_scan(&store, "k1", T0);

        let (second, created) = store
            .submit_job("k1", ToolId::ScanIndex, &roots(), &no_params(), None, T0 + 1)
            .unwrap();
        assert!(!created);
        assert_eq!(second, first);
    }

    #[test]
    fn terminal_jobs_release_their_dedupe_key() {
        let store = store();
        let first = submit_scan(&store, "k1", T0);

        let job = store.claim_next_job("w1", T0, LEASE).unwrap().unwrap();
        store
            .complete_job(
                &job.job_id,
                "w1",
                T0 + 5,
                &JobOutcome::Failed {
                    error: "boom".into(),
                },
            )
            .unwrap();

        let (second, created) = store
            .submit_job("k1", ToolId::ScanIndex, &roots(), &no_params(), None, T0 + 10)
            .unwrap();
        assert!(created);
        assert_ne!(second, first);
    }

    #[test]
    fn mutating_submit_requires_approval_token() {
        let store = store();
        let err = store
            .submit_job("k", ToolId::SoftDelete, &roots(), &no_params(), None, T0)
            .unwrap_err();
        assert!(matches!(err, StoreError::ApprovalRequired { tool: "soft_delete" }));

        let ok = store.submit_job("k", ToolId::SoftDelete, &roots(), &no_params(), Some("tok"), T0);
        assert!(ok.is_ok());
    }

    // ---------------- claiming & leases ----------------

    #[test]
    fn claim_is_fifo_with_job_id_tiebreak() {
        let store = store();
        let a = submit_scan(&store, "ka", T0);
        let b = submit_scan(&store, "kb", T0 + 1);

        let first = store.claim_next_job("w1", T0 + 10, LEASE).unwrap().unwrap();
        assert_eq!(first.job_id, a);
        let second = store.claim_next_job("w2", T0 + 10, LEASE).unwrap().unwrap();
        assert_eq!(second.job_id, b);
        assert!(store.claim_next_job("w3", T0 + 10, LEASE).unwrap().is_none());
    }

    #[test]
    fn claim_sets_lease_fields_and_started_once() {
        let store = store();
        submit_scan(&store, "k", T0);

        let job = store.claim_next_job("w1", T0 + 10, LEASE).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.lease_owner.as_deref(), Some("w1"));
        assert_eq!(job.lease_expires_at_ms, Some(T0 + 10 + LEASE));
        assert_eq!(job.started_at_ms, Some(T0 + 10));

        // Reclaim after expiry: started_at_ms is preserved from first claim.
        let reclaim_at = T0 + 10 + LEASE + 1;
        let again = store
            .claim_next_job("w2", reclaim_at, LEASE)
            .unwrap()
            .unwrap();
        assert_eq!(again.job_id, job.job_id);
        assert_eq!(again.status, JobStatus::Running);
        assert_eq!(again.lease_owner.as_deref(), Some("w2"));
        assert_eq!(again.started_at_ms, Some(T0 + 10));
    }

    #[test]
    fn running_job_with_live_lease_is_not_reclaimable() {
        let store = store();
        submit_scan(&store, "k", T0);
        store.claim_next_job("w1", T0, LEASE).unwrap().unwrap();

        assert!(store
            .claim_next_job("w2", T0 + LEASE - 1, LEASE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn renew_extends_only_for_the_owner() {
        let store = store();
        submit_scan(&store, "k", T0);
        let job = store.claim_next_job("w1", T0, LEASE).unwrap().unwrap();

        store.renew_lease(&job.job_id, "w1", T0 + 10, LEASE).unwrap();
        let row = store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(row.lease_expires_at_ms, Some(T0 + 10 + LEASE));

        let err = store
            .renew_lease(&job.job_id, "w2", T0 + 11, LEASE)
            .unwrap_err();
        assert!(matches!(err, StoreError::Preempted { .. }));
    }

    #[test]
    fn preempted_worker_cannot_complete() {
        let store = store();
        submit_scan(&store, "k", T0);
        let job = store.claim_next_job("w1", T0, LEASE).unwrap().unwrap();

        // Lease expires; another worker reclaims.
        let reclaim_at = T0 + LEASE + 1;
        let reclaimed = store
            .claim_next_job("w2", reclaim_at, LEASE)
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.job_id, job.job_id);

        // The original worker's completion is rejected; no result lands.
        let err = store
            .complete_job(
                &job.job_id,
                "w1",
                reclaim_at + 1,
                &JobOutcome::Succeeded {
                    bytes: b"stale".to_vec(),
                    content_type: "text/plain".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Preempted { .. }));
        assert!(store.get_result(&job.job_id).unwrap().is_none());

        // The new owner completes normally.
        store
            .complete_job(
                &job.job_id,
                "w2",
                reclaim_at + 2,
                &JobOutcome::Succeeded {
                    bytes: b"fresh".to_vec(),
                    content_type: "text/plain".into(),
                },
            )
            .unwrap();
        let (bytes, _) = store.get_result(&job.job_id).unwrap().unwrap();
        assert_eq!(bytes, b"fresh");
    }

    #[test]
    fn completion_is_terminal_and_clears_lease() {
        let store = store();
        submit_scan(&store, "k", T0);
        let job = store.claim_next_job("w1", T0, LEASE).unwrap().unwrap();

        store
            .complete_job(
                &job.job_id,
                "w1",
                T0 + 5,
                &JobOutcome::Succeeded {
                    bytes: b"{}".to_vec(),
                    content_type: "application/json".into(),
                },
            )
            .unwrap();

        let row = store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
        assert_eq!(row.finished_at_ms, Some(T0 + 5));
        assert!(row.lease_owner.is_none());
        assert!(row.lease_expires_at_ms.is_none());

        // Terminal rows are not claimable and cannot be completed again.
        assert!(store.claim_next_job("w2", T0 + 10, LEASE).unwrap().is_none());
        let err = store
            .complete_job(
                &job.job_id,
                "w1",
                T0 + 6,
                &JobOutcome::Failed { error: "x".into() },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Preempted { .. }));
    }

    #[test]
    fn result_exists_iff_succeeded() {
        let store = store();
        let ok = submit_scan(&store, "ok", T0);
        let bad = submit_scan(&store, "bad", T0 + 1);

        let job = store.claim_next_job("w1", T0 + 2, LEASE).unwrap().unwrap();
        assert_eq!(job.job_id, ok);
        store
            .complete_job(
                &ok,
                "w1",
                T0 + 3,
                &JobOutcome::Succeeded {
                    bytes: b"r".to_vec(),
                    content_type: "text/plain".into(),
                },
            )
            .unwrap();

        let job = store.claim_next_job("w1", T0 + 4, LEASE).unwrap().unwrap();
        assert_eq!(job.job_id, bad);
        store
            .complete_job(&bad, "w1", T0 + 5, &JobOutcome::Failed { error: "e".into() })
            .unwrap();

        assert!(store.get_result(&ok).unwrap().is_some());
        assert!(store.get_result(&bad).unwrap().is_none());
        let row = store.get_job(&bad).unwrap().unwrap();
        assert_eq!(row.error_message.as_deref(), Some("e"));
    }

    // ---------------- approvals ----------------

    fn succeed_plan(store: &CpStore, bytes: &[u8]) -> String {
        let plan_id = submit_scan(store, &format!("plan-{}", Uuid::new_v4()), T0);
        let job = store.claim_next_job("w1", T0, LEASE).unwrap().unwrap();
        assert_eq!(job.job_id, plan_id);
        store
            .complete_job(
                &plan_id,
                "w1",
                T0 + 1,
                &JobOutcome::Succeeded {
                    bytes: bytes.to_vec(),
                    content_type: "application/json".into(),
                },
            )
            .unwrap();
        plan_id
    }

    #[test]
    fn approval_lifecycle_mint_consume_once() {
        let store = store();
        let plan_id = succeed_plan(&store, b"{\"moves\":[]}");
        let hash = coworker_core::plan::sha256_hex(b"{\"moves\":[]}");

        let approval = store
            .mint_approval(&plan_id, &hash, 120_000, T0 + 10)
            .unwrap();
        assert_eq!(approval.plan_hash, hash);
        assert_eq!(approval.expires_at_ms, T0 + 10 + 120_000);

        let consumed = store
            .consume_approval(&approval.token, Some(&plan_id), T0 + 20)
            .unwrap();
        assert_eq!(consumed.plan_job_id, plan_id);

        // Single-use: the second consumption sees no row.
        let err = store
            .consume_approval(&approval.token, Some(&plan_id), T0 + 21)
            .unwrap_err();
        assert!(matches!(err, StoreError::ApprovalUnknown));
    }

    #[test]
    fn mint_rejects_missing_unsucceeded_and_drifted_plans() {
        let store = store();
        let hash = coworker_core::plan::sha256_hex(b"x");

        let err = store.mint_approval("nope", &hash, 1000, T0).unwrap_err();
        assert!(matches!(err, StoreError::PlanNotFound { .. }));

        let plan_id = succeed_plan(&store, b"real-bytes");
        let err = store.mint_approval(&plan_id, &hash, 1000, T0).unwrap_err();
        assert!(matches!(err, StoreError::PlanHashMismatch { .. }));

        let queued = submit_scan(&store, "q", T0 + 100);
        let err = store.mint_approval(&queued, &hash, 1000, T0).unwrap_err();
        assert!(matches!(err, StoreError::PlanNotSucceeded { .. }));
    }

    #[test]
    fn expired_approval_cannot_be_consumed() {
        let store = store();
        let plan_id = succeed_plan(&store, b"p");
        let hash = coworker_core::plan::sha256_hex(b"p");
        let approval = store.mint_approval(&plan_id, &hash, 1000, T0).unwrap();

        let err = store
            .consume_approval(&approval.token, Some(&plan_id), T0 + 1000)
            .unwrap_err();
        assert!(matches!(err, StoreError::ApprovalExpired));

        // The expired row was swept; replay is now Unknown.
        let err = store
            .consume_approval(&approval.token, Some(&plan_id), T0 + 1001)
            .unwrap_err();
        assert!(matches!(err, StoreError::ApprovalUnknown));
    }

    #[test]
    fn mismatched_plan_binding_is_rejected_without_consuming() {
        let store = store();
        let plan_id = succeed_plan(&store, b"p");
        let hash = coworker_core::plan::sha256_hex(b"p");
        let approval = store.mint_approval(&plan_id, &hash, 60_000, T0).unwrap();

        let err = store
            .consume_approval(&approval.token, Some("other-plan"), T0 + 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::ApprovalMismatch { .. }));

        // Still consumable for its own plan.
        assert!(store
            .consume_approval(&approval.token, Some(&plan_id), T0 + 2)
            .is_ok());
    }

    #[test]
    fn purge_sweeps_only_expired_approvals() {
        let store = store();
        let plan_id = succeed_plan(&store, b"p");
        let hash = coworker_core::plan::sha256_hex(b"p");
        let short = store.mint_approval(&plan_id, &hash, 100, T0).unwrap();
        let long = store.mint_approval(&plan_id, &hash, 100_000, T0).unwrap();

        assert_eq!(store.purge_expired_approvals(T0 + 200).unwrap(), 1);
        assert!(matches!(
            store.consume_approval(&short.token, None, T0 + 300),
            Err(StoreError::ApprovalUnknown)
        ));
        assert!(store.consume_approval(&long.token, None, T0 + 300).is_ok());
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cp.sqlite3");

        let job_id = {
            let store = CpStore::open(&path).unwrap();
            submit_scan(&store, "persist", T0)
        };

        let store = CpStore::open(&path).unwrap();
        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.dedupe_key, "persist");
    }
}
