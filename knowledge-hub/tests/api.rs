use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use knowledge_hub::api;
use knowledge_hub_core::{BackendMode, Config, StorageManager};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn app(dir: &TempDir) -> Router {
    let config = Config {
        mode: BackendMode::Database,
        base_path: dir.path().to_path_buf(),
        ..Config::default()
    };
    let manager = StorageManager::open(config).await.unwrap();
    api::router(Arc::new(manager))
}

fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("X-User-Id", user);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

#[tokio::test]
async fn missing_user_header_is_unauthorized() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let (status, _) = send(&app, request("GET", "/docs/users/bob/a.md", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn team_document_lifecycle_over_http() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let (status, _) = send(&app, request("POST", "/teams", Some("alice"), Some(json!({"name": "eng"})))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, team) = send(
        &app,
        request(
            "POST",
            "/teams/eng/members",
            Some("alice"),
            Some(json!({"user": "bob", "role": "member"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(team["members"]["bob"], "member");

    let (status, _) = send(
        &app,
        request(
            "POST",
            "/grants",
            Some("alice"),
            Some(json!({
                "prefix": "/teams/eng/",
                "principal": {"kind": "team", "id": "eng"},
                "permissions": ["read", "write"]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, written) = send(
        &app,
        request("PUT", "/docs/teams/eng/doc.md", Some("bob"), Some(json!({"content": "hello"}))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(written["version"], 1);
    assert_eq!(written["token"], "v1");

    let (status, doc) = send(&app, request("GET", "/docs/teams/eng/doc.md", Some("bob"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["content"], "hello");
    assert_eq!(doc["path"], "/teams/eng/doc.md");

    let (status, _) = send(&app, request("GET", "/docs/teams/eng/doc.md", Some("carol"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, err) = send(
        &app,
        request(
            "PUT",
            "/docs/teams/eng/doc.md",
            Some("bob"),
            Some(json!({"content": "late", "expected_token": "v0"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "version_conflict");
    assert_eq!(err["current_token"], "v1");

    let (status, entries) = send(&app, request("GET", "/list?prefix=/teams/eng/", Some("bob"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries[0]["path"], "/teams/eng/doc.md");

    let (status, hits) = send(&app, request("GET", "/search?q=hello", Some("bob"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hits.as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        request("DELETE", "/docs/teams/eng/doc.md?expected_token=v1", Some("bob"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, history) = send(&app, request("GET", "/history/teams/eng/doc.md", Some("bob"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn private_shares_and_bad_paths_are_bad_requests() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let (status, err) = send(
        &app,
        request(
            "POST",
            "/grants",
            Some("alice"),
            Some(json!({
                "prefix": "/users/alice/private/",
                "principal": {"kind": "user", "id": "bob"},
                "permissions": ["read"]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "invalid_path");

    let (status, _) = send(
        &app,
        request("PUT", "/docs/users/alice/.git/x", Some("alice"), Some(json!({"content": "x"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_reports_backend_and_cache() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    send(
        &app,
        request("PUT", "/docs/users/bob/a.md", Some("bob"), Some(json!({"content": "a"}))),
    )
    .await;
    let (status, body) = send(&app, request("GET", "/status", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "database");
    assert_eq!(body["readiness"], "READY");
    assert_eq!(body["document_count"], 1);
    assert!(body["cache"].is_object());
}
