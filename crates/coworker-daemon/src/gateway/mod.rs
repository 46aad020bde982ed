//! Loopback HTTP gateway.
//!
//! Terminates HTTP on the loopback address and translates between the
//! wire shape and store operations. Every endpoint except `/handshake`
//! authenticates via the `X-Coworker-Session` / `X-Coworker-Token`
//! header pair.
//!
//! The gateway rejects bad submissions synchronously (unknown tool,
//! malformed params, missing approval token, path outside the configured
//! workspace roots), so no job row is ever created for an invalid
//! request. It touches the filesystem only to canonicalize paths; all
//! real I/O happens in workers.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path as UrlPath, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use coworker_core::scope::{ScopeError, WorkspaceScope};
use coworker_core::tool::{self, JobParams, ToolError, ToolId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{now_ms, CpStore, JobStatus};

pub mod error;

pub use error::ApiError;

/// Session id header.
pub const SESSION_HEADER: &str = "x-coworker-session";
/// Session token header.
pub const TOKEN_HEADER: &str = "x-coworker-token";

/// Request body cap; job params are small, document payloads modest.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Approval TTL clamp bounds, seconds.
const MIN_APPROVAL_TTL_SECS: u64 = 10;
const MAX_APPROVAL_TTL_SECS: u64 = 3600;
const DEFAULT_APPROVAL_TTL_SECS: u64 = 120;

/// Shared state behind every gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    store: CpStore,
    scope: Arc<WorkspaceScope>,
}

impl GatewayState {
    /// Bundles the store with the server-configured workspace scope.
    #[must_use]
    pub fn new(store: CpStore, scope: Arc<WorkspaceScope>) -> Self {
        Self { store, scope }
    }
}

/// Builds the gateway router.
#[must_use]
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/handshake", post(handshake))
        .route("/tools", get(list_tools))
        .route("/jobs", post(submit_job))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/result", get(get_job_result))
        .route("/approve", post(approve_plan))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn require_session(state: &GatewayState, headers: &HeaderMap) -> Result<(), ApiError> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let valid = state
        .store
        .authenticate(session_id, token)
        .map_err(ApiError::from)?;
    if valid {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

// =============================================================================
// /handshake
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct HandshakeResponse {
    session_id: String,
    token: String,
}

async fn handshake(
    State(state): State<GatewayState>,
) -> Result<Json<HandshakeResponse>, ApiError> {
    let (session_id, token) = state.store.create_session(now_ms())?;
    info!(session_id = %session_id, "session minted");
    Ok(Json(HandshakeResponse { session_id, token }))
}

// =============================================================================
// /tools
// =============================================================================

#[derive(Debug, Serialize)]
struct ToolEntry {
    id: i64,
    name: &'static str,
    mutating: bool,
    params: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ToolsResponse {
    tools: Vec<ToolEntry>,
}

async fn list_tools(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<ToolsResponse>, ApiError> {
    require_session(&state, &headers)?;
    let tools = tool::descriptors()
        .iter()
        .map(|descriptor| ToolEntry {
            id: descriptor.id.wire_id(),
            name: descriptor.name,
            mutating: descriptor.mutating,
            params: descriptor.param_keys(),
        })
        .collect();
    Ok(Json(ToolsResponse { tools }))
}

// =============================================================================
// /jobs (submit)
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubmitJobBody {
    dedupe_key: String,
    #[serde(rename = "type")]
    type_id: i64,
    allowed_roots: Vec<String>,
    #[serde(default)]
    params: JobParams,
    #[serde(default)]
    approval_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: String,
    created: bool,
    status: i64,
}

/// Validates a submission against the registry and the server scope,
/// returning the canonical allowed roots to persist.
fn validate_submission(
    state: &GatewayState,
    body: &SubmitJobBody,
) -> Result<(ToolId, Vec<String>), ApiError> {
    let Some(tool_id) = ToolId::from_wire(body.type_id) else {
        return Err(ApiError::InvalidArgument(format!(
            "unknown tool type: {}",
            body.type_id
        )));
    };
    let descriptor = tool_id.descriptor();

    descriptor
        .validate_params(&body.params)
        .map_err(|err| match err {
            ToolError::MissingParam { name } => {
                ApiError::InvalidArgument(format!("missing parameter: {name}"))
            }
            ToolError::UnknownParam { name } => {
                ApiError::InvalidArgument(format!("unknown parameter: {name}"))
            }
            other => ApiError::InvalidArgument(other.to_string()),
        })?;

    if descriptor.mutating && body.approval_token.is_none() {
        return Err(ApiError::ApprovalRequired);
    }

    if body.allowed_roots.is_empty() {
        return Err(ApiError::InvalidArgument(
            "allowed_roots must not be empty".to_string(),
        ));
    }

    // Every declared root must be absolute and land inside a configured
    // server root after full symlink resolution.
    let mut canonical_roots = Vec::with_capacity(body.allowed_roots.len());
    for root in &body.allowed_roots {
        if !Path::new(root).is_absolute() {
            return Err(ApiError::InvalidArgument(format!(
                "allowed root is not absolute: {root}"
            )));
        }
        let resolved = state
            .scope
            .resolve(root)
            .map_err(|err| scope_to_api(&err, root))?;
        canonical_roots.push(resolved.display().to_string());
    }

    // Path-shaped params are judged against the job's own root set, which
    // transitively pins them inside the server scope as well.
    let job_scope = WorkspaceScope::new(&canonical_roots).map_err(|err| {
        ApiError::InvalidArgument(format!("unusable allowed_roots: {err}"))
    })?;
    for path_param in descriptor.path_params {
        if let Some(value) = body.params.get(*path_param) {
            if !Path::new(value).is_absolute() {
                return Err(ApiError::InvalidArgument(format!(
                    "parameter {path_param} is not an absolute path: {value}"
                )));
            }
            job_scope
                .resolve(value)
                .map_err(|err| scope_to_api(&err, value))?;
        }
    }

    Ok((tool_id, canonical_roots))
}

fn scope_to_api(err: &ScopeError, path: &str) -> ApiError {
    match err {
        ScopeError::OutsideRoots { .. } | ScopeError::Traversal { .. } => {
            ApiError::Forbidden(format!("path escapes allowed roots: {path}"))
        }
        _ => ApiError::InvalidArgument(format!("unresolvable path {path}: {err}")),
    }
}

async fn submit_job(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<SubmitJobBody>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    require_session(&state, &headers)?;
    let (tool_id, canonical_roots) = validate_submission(&state, &body)?;

    let (job_id, created) = state.store.submit_job(
        &body.dedupe_key,
        tool_id,
        &canonical_roots,
        &body.params,
        body.approval_token.as_deref(),
        now_ms(),
    )?;

    if created {
        info!(job_id = %job_id, tool = tool_id.name(), "job queued");
    } else {
        debug!(job_id = %job_id, dedupe_key = %body.dedupe_key, "submission coalesced");
    }
    Ok(Json(SubmitJobResponse {
        job_id,
        created,
        status: JobStatus::Queued.wire_code(),
    }))
}

// =============================================================================
// /jobs/{id}
// =============================================================================

/// The job row as exposed on the wire: everything except the result blob
/// and the approval token.
#[derive(Debug, Serialize)]
struct JobView {
    job_id: String,
    dedupe_key: String,
    #[serde(rename = "type")]
    type_id: i64,
    status: i64,
    created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    params: JobParams,
    allowed_roots: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_expires_at_ms: Option<u64>,
}

async fn get_job(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<JobView>, ApiError> {
    require_session(&state, &headers)?;
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))?;

    Ok(Json(JobView {
        job_id: job.job_id,
        dedupe_key: job.dedupe_key,
        type_id: job.tool.wire_id(),
        status: job.status.wire_code(),
        created_at_ms: job.created_at_ms,
        started_at_ms: job.started_at_ms,
        finished_at_ms: job.finished_at_ms,
        error_message: job.error_message,
        params: job.params,
        allowed_roots: job.allowed_roots,
        lease_owner: job.lease_owner,
        lease_expires_at_ms: job.lease_expires_at_ms,
    }))
}

// =============================================================================
// /jobs/{id}/result
// =============================================================================

#[derive(Debug, Serialize)]
struct JobResultResponse {
    bytes_base64: String,
    content_type: String,
}

async fn get_job_result(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<JobResultResponse>, ApiError> {
    require_session(&state, &headers)?;
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))?;

    match job.status {
        JobStatus::Queued | JobStatus::Running => Err(ApiError::NotReady),
        JobStatus::Failed => Err(ApiError::NotFound(format!(
            "job failed without a result: {job_id}"
        ))),
        JobStatus::Succeeded => {
            // A succeeded job commits its result in the same transaction,
            // so this read cannot miss.
            let (bytes, content_type) = state
                .store
                .get_result(&job_id)?
                .ok_or(ApiError::Internal)?;
            Ok(Json(JobResultResponse {
                bytes_base64: STANDARD.encode(bytes),
                content_type,
            }))
        }
    }
}

// =============================================================================
// /approve
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApprovePlanBody {
    plan_job_id: String,
    #[serde(default = "default_ttl_seconds")]
    ttl_seconds: u64,
}

const fn default_ttl_seconds() -> u64 {
    DEFAULT_APPROVAL_TTL_SECS
}

#[derive(Debug, Serialize)]
struct ApprovePlanResponse {
    approval_token: String,
    plan_job_id: String,
    plan_hash: String,
    expires_at_ms: u64,
    ttl_seconds: u64,
}

async fn approve_plan(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<ApprovePlanBody>,
) -> Result<Json<ApprovePlanResponse>, ApiError> {
    require_session(&state, &headers)?;
    let now = now_ms();
    if let Err(err) = state.store.purge_expired_approvals(now) {
        warn!(error = %err, "approval sweep failed");
    }

    let job = state
        .store
        .get_job(&body.plan_job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("plan job not found: {}", body.plan_job_id)))?;
    if job.status != JobStatus::Succeeded {
        return Err(ApiError::BadState(format!(
            "plan job {} has not succeeded",
            body.plan_job_id
        )));
    }
    let (plan_bytes, _) = state
        .store
        .get_result(&body.plan_job_id)?
        .ok_or_else(|| ApiError::NotFound("plan result not found".to_string()))?;

    // The commitment covers the stored result bytes verbatim.
    let plan_hash = coworker_core::plan::sha256_hex(&plan_bytes);
    let ttl_seconds = body
        .ttl_seconds
        .clamp(MIN_APPROVAL_TTL_SECS, MAX_APPROVAL_TTL_SECS);

    let approval =
        state
            .store
            .mint_approval(&body.plan_job_id, &plan_hash, ttl_seconds * 1000, now)?;

    info!(plan_job_id = %approval.plan_job_id, ttl_seconds, "approval minted");
    Ok(Json(ApprovePlanResponse {
        approval_token: approval.token,
        plan_job_id: approval.plan_job_id,
        plan_hash: approval.plan_hash,
        expires_at_ms: approval.expires_at_ms,
        ttl_seconds,
    }))
}
