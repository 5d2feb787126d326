//! Integration tests for the request pipeline and the HTTP API.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

mod common;

use common::{BrokenProvider, EchoProvider, test_app, test_config};
use modelmux::gateway::{Gateway, ToolRequest};
use modelmux::session::{FileSessionStore, SessionState};

fn source() -> std::net::SocketAddr {
    "10.0.0.1:50000".parse().unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// POST /v1/connections with a simulated peer address.
async fn connect(app: &axum::Router) -> String {
    let mut request = Request::post("/v1/connections")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(source()));

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    json["connection_id"].as_str().unwrap().to_string()
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[tokio::test]
async fn test_livez() {
    let (app, _gateway) = test_app();

    let response = app
        .oneshot(Request::get("/livez").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_version() {
    let (app, _gateway) = test_app();

    let response = app
        .oneshot(Request::get("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json.get("version").is_some());
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_and_disconnect() {
    let (app, gateway) = test_app();

    let connection_id = connect(&app).await;
    assert!(connection_id.starts_with("con_"));
    assert!(gateway.admission().is_registered(&connection_id));

    let response = app
        .clone()
        .oneshot(
            Request::delete(format!("/v1/connections/{connection_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!gateway.admission().is_registered(&connection_id));
}

// ============================================================================
// Request Dispatch
// ============================================================================

#[tokio::test]
async fn test_request_flow_creates_session() {
    let (app, _gateway) = test_app();
    let connection_id = connect(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::post("/v1/requests")
                .header("content-type", "application/json")
                .header("x-connection-id", &connection_id)
                .body(Body::from(
                    json!({
                        "request_id": "req-1",
                        "owner_id": "owner-a",
                        "provider": "echo",
                        "tool": "search",
                        "arguments": { "q": "rust" },
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["request_id"], "req-1");
    assert!(json["session_id"].as_str().unwrap().starts_with("ses_"));
    assert_eq!(json["result"]["tool"], "search");

    // The session shows up in the listing with its activity recorded.
    let response = app
        .oneshot(Request::get("/v1/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let sessions = body_json(response).await;
    assert_eq!(sessions["sessions"].as_array().unwrap().len(), 1);
    assert_eq!(sessions["sessions"][0]["request_count"], 1);
}

#[tokio::test]
async fn test_request_without_connection_header_is_rejected() {
    let (app, _gateway) = test_app();

    let response = app
        .oneshot(
            Request::post("/v1/requests")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "request_id": "req-1",
                        "owner_id": "owner-a",
                        "provider": "echo",
                        "tool": "search",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "missing_connection_header");
}

#[tokio::test]
async fn test_request_with_unadmitted_connection_is_rejected() {
    let (app, _gateway) = test_app();

    let response = app
        .oneshot(
            Request::post("/v1/requests")
                .header("content-type", "application/json")
                .header("x-connection-id", "con_FORGED")
                .body(Body::from(
                    json!({
                        "request_id": "req-1",
                        "owner_id": "owner-a",
                        "provider": "echo",
                        "tool": "search",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "unknown_connection");
}

#[tokio::test]
async fn test_unknown_provider_maps_to_not_found() {
    let (app, _gateway) = test_app();
    let connection_id = connect(&app).await;

    let response = app
        .oneshot(
            Request::post("/v1/requests")
                .header("content-type", "application/json")
                .header("x-connection-id", &connection_id)
                .body(Body::from(
                    json!({
                        "request_id": "req-1",
                        "owner_id": "owner-a",
                        "provider": "nonexistent",
                        "tool": "search",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "unknown_provider");
}

// ============================================================================
// Resilience Surface
// ============================================================================

#[tokio::test]
async fn test_failing_provider_opens_breaker_and_maps_statuses() {
    let (app, gateway) = test_app();
    gateway.providers().register("broken", Arc::new(BrokenProvider), None);
    let connection_id = connect(&app).await;

    let request = |id: &str| {
        Request::post("/v1/requests")
            .header("content-type", "application/json")
            .header("x-connection-id", &connection_id)
            .body(Body::from(
                json!({
                    "request_id": id,
                    "owner_id": "owner-a",
                    "provider": "broken",
                    "tool": "search",
                })
                .to_string(),
            ))
            .unwrap()
    };

    // Default failure threshold is 5 composed failures; drive the breaker
    // open, then observe the fast-fail mapping.
    for i in 0..5 {
        let response = app.clone().oneshot(request(&format!("req-{i}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "provider_server_error");
    }

    let response = app.clone().oneshot(request("req-open")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "circuit_open");

    // Diagnostics expose the open breaker.
    let response = app
        .oneshot(Request::get("/v1/diagnostics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let diag = body_json(response).await;
    let breakers = diag["breakers"].as_array().unwrap();
    let broken = breakers
        .iter()
        .find(|b| b["provider"] == "broken")
        .unwrap();
    assert_eq!(broken["state"], "open");
}

// ============================================================================
// Restart Recovery
// ============================================================================

#[tokio::test]
async fn test_sessions_survive_restart_as_disconnected() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    let session_id = {
        let store = Arc::new(FileSessionStore::new(tmp.path().to_path_buf()));
        let gateway = Gateway::new(&config, store);
        gateway.admission().register("con-1", source().ip()).unwrap();
        let provider = Arc::new(EchoProvider::new());
        gateway.providers().register("echo", provider.clone(), None);

        let response = gateway
            .handle(ToolRequest {
                request_id: "req-1".to_string(),
                connection_id: "con-1".to_string(),
                owner_id: "owner-a".to_string(),
                session_id: None,
                provider: "echo".to_string(),
                tool: "search".to_string(),
                arguments: json!({ "q": "rust" }),
            })
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        response.session_id
    };

    // Fresh gateway over the same store path simulates a restart.
    let store = Arc::new(FileSessionStore::new(tmp.path().to_path_buf()));
    let gateway = Gateway::new(&config, store);
    let recovered = gateway.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let record = gateway
        .sessions()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, SessionState::Disconnected);
    assert_eq!(record.request_count, 1);
}
