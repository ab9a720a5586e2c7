use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use workspace_agent::config::ServerConfig;
use workspace_agent::router::{build_router_with_state, AppState};
use workspace_agent_sandbox_runtime::testing::FakeRuntime;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    runtime: FakeRuntime,
    workspace_root: TempDir,
}

impl TestApp {
    fn new() -> Self {
        let workspace_root = tempfile::tempdir().expect("create workspace root");
        let runtime = FakeRuntime::new();
        let config = ServerConfig {
            workspace_root: workspace_root.path().to_path_buf(),
            idle_ttl: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(300),
            sandbox_image: "test-image".to_string(),
            runner_bin: "runner".to_string(),
        };
        let state =
            AppState::new(config, Arc::new(runtime.clone())).expect("create app state");
        let (app, state) = build_router_with_state(Arc::new(state));
        Self {
            app,
            state,
            runtime,
            workspace_root,
        }
    }
}

async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).expect("build request"))
        .await
        .expect("send request");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (status, bytes.to_vec())
}

fn parse_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("parse json body")
}

/// Parse an SSE body into (event name, ConversationEvent-as-json) pairs.
fn parse_sse(body: &[u8]) -> Vec<(String, Value)> {
    let text = String::from_utf8_lossy(body);
    let mut events = Vec::new();
    for chunk in text.split("\n\n").filter(|chunk| !chunk.trim().is_empty()) {
        let mut name = String::new();
        let mut data = String::new();
        for line in chunk.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                name = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data.push_str(rest);
            }
        }
        if !data.is_empty() {
            events.push((
                name,
                serde_json::from_str(&data).unwrap_or(Value::Null),
            ));
        }
    }
    events
}

fn find_event<'a>(events: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    events
        .iter()
        .find(|(event_name, _)| event_name == name)
        .map(|(_, data)| data)
}

async fn start_conversation(app: &Router, body: Value) -> (String, String, Vec<(String, Value)>) {
    let (status, bytes) = send_request(app, Method::POST, "/v1/conversation", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&bytes);
    let ready = find_event(&events, "conversation-ready").expect("conversation-ready event");
    let workspace_id = ready["workspace_id"].as_str().expect("workspace id").to_string();
    let conversation_id = ready["conversation_id"]
        .as_str()
        .expect("conversation id")
        .to_string();
    (workspace_id, conversation_id, events)
}

#[tokio::test]
async fn health_reports_sessions_and_runtime() {
    let test_app = TestApp::new();

    let (status, body) = send_request(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["runtime"], "ok");
    assert_eq!(body["sessions"], 0);

    let (status, _) = send_request(&test_app.app, Method::GET, "/v1/anything", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn conversation_stream_ends_finished_with_gap_free_sequences() {
    let test_app = TestApp::new();

    let (workspace_id, conversation_id, events) = start_conversation(
        &test_app.app,
        json!({ "message": "create a file named tree.txt" }),
    )
    .await;
    assert!(!workspace_id.is_empty());
    assert!(!conversation_id.is_empty());

    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"message-queued"));
    assert!(names.contains(&"agent-event"));
    assert_eq!(*names.last().unwrap(), "cleanup-complete");

    let finished = find_event(&events, "conversation-finished").expect("finished event");
    assert_eq!(finished["payload"]["state"], "finished");

    let sequences: Vec<u64> = events
        .iter()
        .map(|(_, data)| data["sequence"].as_u64().expect("sequence"))
        .collect();
    let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
    assert_eq!(sequences, expected, "no gaps, no duplicates, from 1");

    // The durable archive serves the same sequence without a subscription.
    let (status, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/workspace/{workspace_id}/conversations/{conversation_id}/events"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    assert_eq!(body["event_count"].as_u64().unwrap() as usize, events.len());

    // Offset replay skips what the caller has already seen.
    let (status, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!(
            "/v1/workspace/{workspace_id}/conversations/{conversation_id}/events?offset=2"
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    assert_eq!(
        body["events"][0]["sequence"].as_u64().unwrap(),
        3,
        "replay starts after the offset"
    );

    let (status, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/workspace/{workspace_id}/conversations/{conversation_id}/state"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["state"]["state"], "finished");
}

#[tokio::test]
async fn follow_up_message_reuses_the_sandbox() {
    let test_app = TestApp::new();
    test_app.runtime.set_turn_lines(vec![
        r#"{"kind":"agent_action","payload":{"summary":"working"}}"#.to_string(),
        r#"{"kind":"lifecycle","payload":{"status":"awaiting_input"}}"#.to_string(),
    ]);

    let (workspace_id, conversation_id, _) = start_conversation(
        &test_app.app,
        json!({ "message": "create a file named tree.txt" }),
    )
    .await;

    let (second_workspace, second_conversation, _) = start_conversation(
        &test_app.app,
        json!({
            "message": "now add a second line",
            "workspace_id": workspace_id,
            "conversation_id": conversation_id,
        }),
    )
    .await;
    assert_eq!(second_workspace, workspace_id);
    assert_eq!(second_conversation, conversation_id);
    assert_eq!(test_app.runtime.started(), 1, "no second container start");
}

#[tokio::test]
async fn simultaneous_posts_for_a_new_workspace_start_one_container() {
    let test_app = TestApp::new();
    test_app
        .runtime
        .set_start_delay(Duration::from_millis(50));

    let body = json!({ "message": "boot", "workspace_id": "fresh-workspace" });
    let first = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversation",
        Some(body.clone()),
    );
    let second = send_request(&test_app.app, Method::POST, "/v1/conversation", Some(body));
    let ((status_a, _), (status_b, _)) = tokio::join!(first, second);

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(test_app.runtime.started(), 1, "exactly one container start");
}

#[tokio::test]
async fn malformed_conversation_requests_are_rejected() {
    let test_app = TestApp::new();

    // Missing message field entirely.
    let (status, _) =
        send_request(&test_app.app, Method::POST, "/v1/conversation", Some(json!({}))).await;
    assert!(status.is_client_error());

    // Blank message: rejected before any session work.
    let (status, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversation",
        Some(json!({ "message": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:workspace-agent:error:invalid_request"
    );
    assert_eq!(test_app.runtime.started(), 0);

    // Resuming an unknown conversation id.
    let (status, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversation",
        Some(json!({ "message": "hello", "conversation_id": "no-such-conversation" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:workspace-agent:error:conversation_not_found"
    );
}

#[tokio::test]
async fn finished_conversation_returns_state_conflict() {
    let test_app = TestApp::new();

    let (workspace_id, conversation_id, _) =
        start_conversation(&test_app.app, json!({ "message": "do the thing" })).await;

    let (status, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversation",
        Some(json!({
            "message": "one more",
            "workspace_id": workspace_id,
            "conversation_id": conversation_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:workspace-agent:error:state_conflict"
    );
}

#[tokio::test]
async fn project_file_download_is_path_contained() {
    let test_app = TestApp::new();

    let (workspace_id, _, _) =
        start_conversation(&test_app.app, json!({ "message": "write some files" })).await;

    let project_dir = test_app
        .workspace_root
        .path()
        .join(&workspace_id)
        .join("project");
    std::fs::create_dir_all(project_dir.join("docs")).unwrap();
    std::fs::write(project_dir.join("docs/notes.txt"), b"hello from the sandbox").unwrap();
    std::fs::write(
        test_app.workspace_root.path().join("host-secret.txt"),
        b"not yours",
    )
    .unwrap();

    let (status, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/workspace/{workspace_id}/project/file?file_path=docs/notes.txt"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello from the sandbox");

    let (status, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!(
            "/v1/workspace/{workspace_id}/project/file?file_path=../../host-secret.txt"
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/workspace/{workspace_id}/project/file?file_path=docs/missing.txt"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/workspace/never-seen/project/file?file_path=docs/notes.txt",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn vscode_info_served_from_cache_and_delete_evicts() {
    let test_app = TestApp::new();

    let (status, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/workspace/never-seen/vscode",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (workspace_id, conversation_id, _) =
        start_conversation(&test_app.app, json!({ "message": "open the editor" })).await;

    // The fake sandbox has no live editor endpoint, so the cache is seeded
    // the way a real fetch would.
    test_app.state.registry().set_vscode(
        &workspace_id,
        Some(workspace_agent::registry::VscodeInfo {
            url: "http://127.0.0.1:9999/?tkn=abc".to_string(),
            fetched_at_ms: 0,
        }),
    );

    let (status, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/workspace/{workspace_id}/vscode"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    assert_eq!(body["url"], "http://127.0.0.1:9999/?tkn=abc");
    assert_eq!(body["source"], "cache");
    assert_eq!(body["ttl_seconds"], 1800);

    let (status, body) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/workspace/{workspace_id}/vscode"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["status"], "stopped");
    assert_eq!(test_app.runtime.stopped(), 1);

    let (status, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/workspace/{workspace_id}/vscode"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The durable archive outlives the session.
    let (status, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/workspace/{workspace_id}/conversations/{conversation_id}/events"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn forced_eviction_refuses_while_a_turn_is_in_flight() {
    let test_app = TestApp::new();
    let gate = test_app.runtime.gate_turns();

    let response = test_app
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/conversation")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "message": "long running turn", "workspace_id": "busy-ws" })
                        .to_string(),
                ))
                .expect("build request"),
        )
        .await
        .expect("send request");
    assert_eq!(response.status(), StatusCode::OK);

    // Give the turn task a moment to take its lease.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = send_request(
        &test_app.app,
        Method::DELETE,
        "/v1/workspace/busy-ws/vscode",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:workspace-agent:error:state_conflict"
    );

    gate.add_permits(1);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    assert!(find_event(&parse_sse(&bytes), "cleanup-complete").is_some());

    let (status, _) = send_request(
        &test_app.app,
        Method::DELETE,
        "/v1/workspace/busy-ws/vscode",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
