use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use web_notes_bridge::classify::classify;
use web_notes_bridge::mentions::{AggregatorConfig, MentionAggregator};
use web_notes_bridge::notes::{NoteService, Query, RestNoteService};
use web_notes_bridge::{MatchKind, QueryError};

const API_KEY: &str = "secret";
const PAGE: &str = "https://a.example/post";

#[derive(Clone, Default)]
struct MockVault {
    searches: Arc<Mutex<Vec<(String, Value)>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(&format!("Bearer {}", API_KEY)[..])
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "errorCode": 40101, "message": "Authorization required" })),
    )
        .into_response()
}

async fn handle_search(State(vault): State<MockVault>, headers: HeaderMap, body: String) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let query: Value = match serde_json::from_str(&body) {
        Ok(query) => query,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({ "message": "bad query" }))).into_response(),
    };
    vault.searches.lock().unwrap().push((content_type, query.clone()));

    let hits = if query.get("regexp").is_some() {
        json!([
            { "filename": "Daily/today.md", "result": true },
            { "filename": "Clips/post.md", "result": true }
        ])
    } else {
        json!([
            { "filename": "Clips/post.md", "result": true },
            { "filename": "Clips/garbled.md", "result": true }
        ])
    };
    Json(hits).into_response()
}

async fn handle_note(headers: HeaderMap, Path(path): Path<String>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    match path.as_str() {
        "Clips/post.md" => Json(json!({
            "path": "Clips/post.md",
            "content": "---\nurl: https://a.example/*\n---\n",
            "tags": ["clip"],
            "frontmatter": { "url": "https://a.example/*", "web-badge-color": "112233" },
            "stat": { "ctime": 0, "mtime": 0, "size": 32 }
        }))
        .into_response(),
        "Clips/garbled.md" => (StatusCode::OK, "not json").into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "errorCode": 40400, "message": "File does not exist" })),
        )
            .into_response(),
    }
}

async fn start_mock(vault: MockVault) -> String {
    let app = Router::new()
        .route("/search/", post(handle_search))
        .route("/vault/{*path}", get(handle_note))
        .with_state(vault);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(endpoint: &str, key: &str) -> RestNoteService {
    RestNoteService::new(endpoint, key, false, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_search_sends_json_logic_with_bearer_token() {
    let vault = MockVault::default();
    let endpoint = start_mock(vault.clone()).await;

    let hits = client(&endpoint, API_KEY).search(&Query::mention(PAGE)).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].filename, "Daily/today.md");

    let searches = vault.searches.lock().unwrap().clone();
    assert_eq!(searches.len(), 1);
    assert_eq!(searches[0].0, "application/vnd.olrapi.jsonlogic+json");
    assert_eq!(searches[0].1, Query::mention(PAGE).to_json_logic());
}

#[tokio::test]
async fn test_status_error_carries_service_message() {
    let endpoint = start_mock(MockVault::default()).await;

    let err = client(&endpoint, "wrong").search(&Query::direct(PAGE)).await.unwrap_err();
    match err {
        QueryError::Status { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Authorization required");
        }
        other => panic!("unexpected error {:?}", other),
    }

    let missing = client(&endpoint, API_KEY).fetch_note("Nope/none.md").await.unwrap_err();
    assert!(matches!(missing, QueryError::Status { status: 404, .. }));
}

#[tokio::test]
async fn test_fetch_note_decodes_metadata() {
    let endpoint = start_mock(MockVault::default()).await;
    let service = client(&endpoint, API_KEY);

    let meta = service.fetch_note("Clips/post.md").await.unwrap();
    assert_eq!(meta.path, "Clips/post.md");
    assert!(meta.tags.contains("clip"));
    assert_eq!(meta.field("url"), Some(&json!("https://a.example/*")));

    let garbled = service.fetch_note("Clips/garbled.md").await.unwrap_err();
    assert!(matches!(garbled, QueryError::Decode(_)));
}

#[tokio::test]
async fn test_unreachable_service_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = client(&endpoint, API_KEY).search(&Query::mention(PAGE)).await.unwrap_err();
    assert!(matches!(err, QueryError::Transport(_)));
}

#[tokio::test]
async fn test_aggregate_over_http() {
    let vault = MockVault::default();
    let endpoint = start_mock(vault.clone()).await;
    let aggregator = MentionAggregator::new(Arc::new(client(&endpoint, API_KEY)), AggregatorConfig::default());

    let result = aggregator.aggregate(PAGE).await.unwrap();
    assert_eq!(result.mentions.len(), 2);
    assert_eq!(result.direct.len(), 1);
    assert_eq!(result.count, 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].filename, "Clips/garbled.md");
    assert_eq!(vault.searches.lock().unwrap().len(), 2);

    let state = classify(&result);
    assert_eq!(state.kind, MatchKind::Direct);
    assert_eq!(state.badge_color.as_deref(), Some("#112233"));
    assert!(state.degraded);
}
