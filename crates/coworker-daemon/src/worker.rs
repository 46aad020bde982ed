//! Worker pool: lease-based job execution.
//!
//! N workers share the store and race claims through its transactional
//! `claim_next_job`; at most one wins a row. A claimed job is executed on
//! a blocking thread while a background heartbeat renews the lease at a
//! third of its duration. Losing the lease, i.e. the heartbeat observing
//! `Preempted`, means another worker has reclaimed the job after expiry;
//! the loser discards its result and never calls `complete_job`.
//!
//! The net effect is at-least-once execution: a crashed worker's job is
//! re-run by whoever reclaims the expired lease, and the tool layer is
//! idempotent at the filesystem level to absorb the replay.
//!
//! For mutating jobs the worker consumes the approval token at claim
//! time; for plan execution it additionally re-reads the plan result and
//! verifies its hash against the consumed approval before the handler
//! sees anything. Approval failures fail the job without a mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coworker_core::plan::{hashes_equal, sha256_hex};
use coworker_core::scope::WorkspaceScope;
use coworker_core::tool::{ToolContext, ToolError, ToolId, ToolSet};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::{now_ms, Approval, CpStore, Job, JobOutcome, StoreError};

/// Bounds of the empty-queue backoff sleep, milliseconds.
const BACKOFF_MIN_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 200;

/// Attempts to persist a completion before abandoning to lease reclaim.
const COMPLETE_ATTEMPTS: u32 = 5;

/// A running pool of workers.
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers with ids `w1..wN`.
    #[must_use]
    pub fn spawn(count: usize, store: CpStore, tools: Arc<ToolSet>, lease_ms: u64) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = (1..=count)
            .map(|n| {
                let worker = Worker {
                    id: format!("w{n}"),
                    store: store.clone(),
                    tools: Arc::clone(&tools),
                    lease_ms,
                    shutdown: Arc::clone(&shutdown),
                };
                tokio::spawn(async move { worker.run().await })
            })
            .collect();
        Self { shutdown, handles }
    }

    /// Signals shutdown and waits for every worker to drain.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task did not exit cleanly");
            }
        }
    }
}

struct Worker {
    id: String,
    store: CpStore,
    tools: Arc<ToolSet>,
    lease_ms: u64,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    async fn run(&self) {
        info!(worker_id = %self.id, "worker started");
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.store.claim_next_job(&self.id, now_ms(), self.lease_ms) {
                Ok(Some(job)) => {
                    debug!(worker_id = %self.id, job_id = %job.job_id, tool = job.tool.name(), "job claimed");
                    self.run_job(job).await;
                }
                Ok(None) => self.backoff().await,
                Err(err) => {
                    warn!(worker_id = %self.id, error = %err, "claim failed");
                    self.backoff().await;
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    async fn backoff(&self) {
        let jitter = rand::thread_rng().gen_range(BACKOFF_MIN_MS..=BACKOFF_MAX_MS);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }

    async fn run_job(&self, job: Job) {
        let descriptor = job.tool.descriptor();
        let now = now_ms();

        // Approval gate, before anything else can mutate.
        let approval = if descriptor.mutating {
            let Some(token) = job.approval_token.as_deref() else {
                self.fail(&job.job_id, "approval token missing on mutating job")
                    .await;
                return;
            };
            let expected = job.params.get("plan_job_id").map(String::as_str);
            match self.store.consume_approval(token, expected, now) {
                Ok(approval) => Some(approval),
                Err(err) => {
                    self.fail(&job.job_id, &format!("approval rejected: {err}"))
                        .await;
                    return;
                }
            }
        } else {
            None
        };

        // Plan drift gate: the bytes executed must be the bytes approved.
        let plan_bytes = if job.tool == ToolId::ExecutePlan {
            let Some(approval) = approval.as_ref() else {
                self.fail(&job.job_id, "execute_plan claimed without approval")
                    .await;
                return;
            };
            match self.verify_plan_binding(&job, approval) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    self.fail(&job.job_id, &err.to_string()).await;
                    return;
                }
            }
        } else {
            None
        };

        let scope = match WorkspaceScope::new(&job.allowed_roots) {
            Ok(scope) => scope,
            Err(err) => {
                self.fail(&job.job_id, &format!("allowed roots unusable: {err}"))
                    .await;
                return;
            }
        };

        let ctx = ToolContext {
            job_id: job.job_id.clone(),
            params: job.params.clone(),
            scope,
            now_ms: now,
            plan: plan_bytes,
        };

        // Heartbeat holds the lease while the handler runs on a blocking
        // thread; a Preempted renewal flips the flag and the result is
        // dropped on the floor.
        let preempted = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            job.job_id.clone(),
            self.id.clone(),
            self.lease_ms,
            Arc::clone(&preempted),
        ));

        let tools = Arc::clone(&self.tools);
        let tool_id = job.tool;
        let executed = tokio::task::spawn_blocking(move || tools.execute(tool_id, &ctx)).await;
        heartbeat.abort();

        if preempted.load(Ordering::SeqCst) {
            warn!(worker_id = %self.id, job_id = %job.job_id, "lease preempted mid-execution; result discarded");
            return;
        }

        let outcome = match executed {
            Ok(Ok(output)) => {
                debug!(worker_id = %self.id, job_id = %job.job_id, bytes = output.bytes.len(), "tool succeeded");
                JobOutcome::Succeeded {
                    bytes: output.bytes,
                    content_type: output.content_type,
                }
            }
            Ok(Err(err)) => JobOutcome::Failed {
                error: err.to_string(),
            },
            Err(join_err) => JobOutcome::Failed {
                error: format!("tool execution panicked: {join_err}"),
            },
        };
        self.complete_with_retry(&job.job_id, &outcome).await;
    }

    /// Re-reads the plan result for an `execute_plan` job and checks it
    /// against the consumed approval's hash commitment. Execution must
    /// see exactly the bytes that were approved; anything else is
    /// [`ToolError::PlanDrift`].
    fn verify_plan_binding(&self, job: &Job, approval: &Approval) -> Result<Vec<u8>, ToolError> {
        let plan_job_id =
            job.params
                .get("plan_job_id")
                .ok_or_else(|| ToolError::MissingParam {
                    name: "plan_job_id".to_string(),
                })?;
        let result =
            self.store
                .get_result(plan_job_id)
                .map_err(|err| ToolError::InvalidParam {
                    name: "plan_job_id".to_string(),
                    reason: format!("plan result unreadable: {err}"),
                })?;
        let Some((bytes, _)) = result else {
            return Err(ToolError::InvalidParam {
                name: "plan_job_id".to_string(),
                reason: format!("plan result not found: {plan_job_id}"),
            });
        };
        if !hashes_equal(&sha256_hex(&bytes), &approval.plan_hash) {
            return Err(ToolError::PlanDrift);
        }
        Ok(bytes)
    }

    async fn fail(&self, job_id: &str, message: &str) {
        warn!(worker_id = %self.id, job_id = %job_id, error = %message, "job failed before execution");
        self.complete_with_retry(
            job_id,
            &JobOutcome::Failed {
                error: message.to_string(),
            },
        )
        .await;
    }

    /// Persists a completion with bounded backoff. A `Preempted` rejection
    /// means another worker owns the row now; the outcome is discarded. A
    /// store that stays unreachable means the lease lapses and the job is
    /// reclaimed elsewhere.
    async fn complete_with_retry(&self, job_id: &str, outcome: &JobOutcome) {
        for attempt in 1..=COMPLETE_ATTEMPTS {
            match self.store.complete_job(job_id, &self.id, now_ms(), outcome) {
                Ok(()) => return,
                Err(StoreError::Preempted { .. }) => {
                    warn!(worker_id = %self.id, job_id = %job_id, "completion rejected; lease was reclaimed");
                    return;
                }
                Err(err) => {
                    warn!(worker_id = %self.id, job_id = %job_id, attempt, error = %err, "completion failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
        }
        error!(worker_id = %self.id, job_id = %job_id, "abandoning completion; job will be reclaimed after lease expiry");
    }
}

async fn heartbeat_loop(
    store: CpStore,
    job_id: String,
    worker_id: String,
    lease_ms: u64,
    preempted: Arc<AtomicBool>,
) {
    let interval = Duration::from_millis((lease_ms / 3).max(1));
    loop {
        tokio::time::sleep(interval).await;
        match store.renew_lease(&job_id, &worker_id, now_ms(), lease_ms) {
            Ok(()) => {}
            Err(StoreError::Preempted { .. }) => {
                preempted.store(true, Ordering::SeqCst);
                return;
            }
            Err(err) => {
                // Transient store trouble: keep trying until the lease
                // question resolves one way or the other.
                warn!(job_id = %job_id, error = %err, "lease renewal failed");
            }
        }
    }
}
