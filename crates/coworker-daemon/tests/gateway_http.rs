//! Gateway integration tests: auth boundary, submit validation, and the
//! polling surface, driven through the axum router without a socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use coworker_core::scope::WorkspaceScope;
use coworker_daemon::gateway::{self, GatewayState, SESSION_HEADER, TOKEN_HEADER};
use coworker_daemon::store::CpStore;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    router: Router,
    store: CpStore,
    workspace: TempDir,
}

fn harness() -> Harness {
    let workspace = TempDir::new().unwrap();
    std::fs::write(workspace.path().join("a.txt"), b"alpha").unwrap();
    let store = CpStore::in_memory().unwrap();
    let scope = Arc::new(WorkspaceScope::new([workspace.path()]).unwrap());
    let router = gateway::router(GatewayState::new(store.clone(), scope));
    Harness {
        router,
        store,
        workspace,
    }
}

impl Harness {
    fn root(&self) -> String {
        self.workspace
            .path()
            .canonicalize()
            .unwrap()
            .display()
            .to_string()
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        session: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((sid, token)) = session {
            builder = builder.header(SESSION_HEADER, sid).header(TOKEN_HEADER, token);
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn handshake(&self) -> (String, String) {
        let (status, body) = self.call("POST", "/handshake", None, None).await;
        assert_eq!(status, StatusCode::OK);
        (
            body["session_id"].as_str().unwrap().to_string(),
            body["token"].as_str().unwrap().to_string(),
        )
    }
}

#[tokio::test]
async fn handshake_needs_no_credentials_and_mints_fresh_ones() {
    let h = harness();
    let (sid_a, token_a) = h.handshake().await;
    let (sid_b, token_b) = h.handshake().await;
    assert_ne!(sid_a, sid_b);
    assert_ne!(token_a, token_b);
    assert!(token_a.len() >= 40);
}

#[tokio::test]
async fn requests_without_valid_credentials_are_401() {
    let h = harness();

    let (status, body) = h.call("GET", "/tools", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "Unauthorized");

    let (status, _) = h
        .call("GET", "/tools", Some(("bogus", "credentials")), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A real session with a wrong token is also 401.
    let (sid, _) = h.handshake().await;
    let (status, _) = h
        .call("GET", "/tools", Some((sid.as_str(), "wrong")), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tools_listing_exposes_ids_names_and_mutating_bits() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let (status, body) = h
        .call("GET", "/tools", Some((&sid, &token)), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let tools = body["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 15);
    let execute = tools.iter().find(|t| t["name"] == "execute_plan").unwrap();
    assert_eq!(execute["id"], 5);
    assert_eq!(execute["mutating"], true);
    let scan = tools.iter().find(|t| t["name"] == "scan_index").unwrap();
    assert_eq!(scan["mutating"], false);
    assert!(scan["params"].as_array().unwrap().contains(&json!("root")));
}

#[tokio::test]
async fn submit_rejects_unknown_tool_and_bad_params() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let session = Some((sid.as_str(), token.as_str()));
    let root = h.root();

    let (status, body) = h
        .call(
            "POST",
            "/jobs",
            session,
            Some(json!({"dedupe_key": "k", "type": 99, "allowed_roots": [root], "params": {}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidArgument");

    // Missing required param.
    let (status, body) = h
        .call(
            "POST",
            "/jobs",
            session,
            Some(json!({"dedupe_key": "k", "type": 1, "allowed_roots": [root], "params": {}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidArgument");

    // Unknown param key.
    let (status, body) = h
        .call(
            "POST",
            "/jobs",
            session,
            Some(json!({
                "dedupe_key": "k", "type": 1, "allowed_roots": [root],
                "params": {"root": root, "recurse": "yes"}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidArgument");
}

#[tokio::test]
async fn path_escape_is_forbidden_and_creates_no_job() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let root = h.root();

    let escape = format!("{root}/../etc/passwd");
    let (status, body) = h
        .call(
            "POST",
            "/jobs",
            Some((&sid, &token)),
            Some(json!({
                "dedupe_key": "escape-1", "type": 3, "allowed_roots": [root],
                "params": {"path": escape}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "Forbidden");

    // Roots outside the server allowlist are refused the same way.
    let (status, body) = h
        .call(
            "POST",
            "/jobs",
            Some((&sid, &token)),
            Some(json!({
                "dedupe_key": "escape-2", "type": 2, "allowed_roots": ["/etc"],
                "params": {"root": "/etc"}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "Forbidden");

    // No job row was created by either rejection: the same dedupe key is
    // still free for a valid submission.
    let (status, body) = h
        .call(
            "POST",
            "/jobs",
            Some((&sid, &token)),
            Some(json!({
                "dedupe_key": "escape-1", "type": 2, "allowed_roots": [root.clone()],
                "params": {"root": root}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], true);
}

#[tokio::test]
async fn mutating_submit_without_token_is_approval_required() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let root = h.root();

    let (status, body) = h
        .call(
            "POST",
            "/jobs",
            Some((&sid, &token)),
            Some(json!({
                "dedupe_key": "del", "type": 6, "allowed_roots": [root.clone()],
                "params": {"path": format!("{root}/a.txt"), "workspace_root": root}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "ApprovalRequired");
}

#[tokio::test]
async fn duplicate_submission_coalesces_onto_one_job() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let root = h.root();
    let body = json!({
        "dedupe_key": "k1", "type": 2, "allowed_roots": [root.clone()],
        "params": {"root": root}
    });

    let (status, first) = h
        .call("POST", "/jobs", Some((&sid, &token)), Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["created"], true);
    assert_eq!(first["status"], 1);

    let (status, second) = h
        .call("POST", "/jobs", Some((&sid, &token)), Some(body))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["created"], false);
    assert_eq!(second["job_id"], first["job_id"]);
}

#[tokio::test]
async fn job_view_hides_the_approval_token() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let root = h.root();

    let (_, submitted) = h
        .call(
            "POST",
            "/jobs",
            Some((&sid, &token)),
            Some(json!({
                "dedupe_key": "del", "type": 6, "allowed_roots": [root.clone()],
                "params": {"path": format!("{root}/a.txt"), "workspace_root": root},
                "approval_token": "secret-token"
            })),
        )
        .await;
    let job_id = submitted["job_id"].as_str().unwrap();

    let (status, view) = h
        .call(
            "GET",
            &format!("/jobs/{job_id}"),
            Some((&sid, &token)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["type"], 6);
    assert_eq!(view["status"], 1);
    assert!(view.get("approval_token").is_none());
    assert!(!view.to_string().contains("secret-token"));
}

#[tokio::test]
async fn result_endpoint_is_not_ready_before_completion() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let root = h.root();

    let (_, submitted) = h
        .call(
            "POST",
            "/jobs",
            Some((&sid, &token)),
            Some(json!({
                "dedupe_key": "k", "type": 2, "allowed_roots": [root.clone()],
                "params": {"root": root}
            })),
        )
        .await;
    let job_id = submitted["job_id"].as_str().unwrap();

    let (status, body) = h
        .call(
            "GET",
            &format!("/jobs/{job_id}/result"),
            Some((&sid, &token)),
            None,
        )
        .await;
    assert_ne!(status, StatusCode::OK);
    assert_eq!(body["code"], "NotReady");

    let (status, body) = h
        .call("GET", "/jobs/missing/result", Some((&sid, &token)), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NotFound");

    // Once a worker commits the result, the endpoint serves it base64'd.
    let claimed = h
        .store
        .claim_next_job("w1", coworker_daemon::now_ms(), 30_000)
        .unwrap()
        .unwrap();
    h.store
        .complete_job(
            &claimed.job_id,
            "w1",
            coworker_daemon::now_ms(),
            &coworker_daemon::JobOutcome::Succeeded {
                bytes: b"payload".to_vec(),
                content_type: "text/plain".to_string(),
            },
        )
        .unwrap();

    let (status, body) = h
        .call(
            "GET",
            &format!("/jobs/{job_id}/result"),
            Some((&sid, &token)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content_type"], "text/plain");
    assert_eq!(body["bytes_base64"], "cGF5bG9hZA==");
}

#[tokio::test]
async fn approve_rejects_missing_and_unfinished_plans() {
    let h = harness();
    let (sid, token) = h.handshake().await;
    let root = h.root();

    let (status, body) = h
        .call(
            "POST",
            "/approve",
            Some((&sid, &token)),
            Some(json!({"plan_job_id": "missing", "ttl_seconds": 60})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NotFound");

    let (_, submitted) = h
        .call(
            "POST",
            "/jobs",
            Some((&sid, &token)),
            Some(json!({
                "dedupe_key": "plan", "type": 4, "allowed_roots": [root.clone()],
                "params": {"root": root}
            })),
        )
        .await;
    let plan_job_id = submitted["job_id"].as_str().unwrap();

    // Still queued: approval is a BadState rejection.
    let (status, body) = h
        .call(
            "POST",
            "/approve",
            Some((&sid, &token)),
            Some(json!({"plan_job_id": plan_job_id, "ttl_seconds": 60})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BadState");
}
