use super::*;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    auth_headers: Arc<Mutex<Vec<String>>>,
    receipts: Arc<Mutex<Vec<(String, Value)>>>,
}

impl ServerState {
    async fn record_auth(&self, headers: &HeaderMap) -> bool {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let authorized = value == "Bearer secret-token";
        self.auth_headers.lock().await.push(value);
        authorized
    }
}

async fn handle_me(State(state): State<ServerState>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !state.record_auth(&headers).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "no token" })));
    }
    (StatusCode::OK, Json(json!({ "_id": "u-me", "name": "Sora" })))
}

async fn handle_matches(State(state): State<ServerState>, headers: HeaderMap) -> Json<Value> {
    state.record_auth(&headers).await;
    Json(json!([
        {
            "_id": "m-1",
            "users": [
                { "_id": "u-me", "name": "Sora" },
                { "_id": "u-2", "name": "Jun", "ownedPets": [{ "_id": "p1", "name": "Mochi" }] }
            ],
            "lastMessage": { "text": "hi", "createdAt": "2024-05-01T10:00:00Z", "from": "u-2" },
            "unreadCount": 2
        },
        {
            "_id": "m-2",
            "users": [{ "_id": "u-me" }, { "_id": "u-3" }]
        }
    ]))
}

async fn handle_history(
    State(state): State<ServerState>,
    Path(match_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.record_auth(&headers).await;
    if match_id == "missing" {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "match not found" })));
    }
    (
        StatusCode::OK,
        Json(json!([
            { "_id": "a", "from": "u-2", "text": "hello", "createdAt": "2024-05-01T10:00:00Z" },
            { "_id": "b", "from": "u-me", "text": "   " },
            { "_id": "c", "from": "u-me", "text": "hey back", "seenBy": ["u-2"] }
        ])),
    )
}

async fn handle_read(
    State(state): State<ServerState>,
    Path(match_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    state.record_auth(&headers).await;
    state.receipts.lock().await.push((match_id, body));
    StatusCode::NO_CONTENT
}

async fn spawn_api_server() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/users/me", get(handle_me))
        .route("/api/matches", get(handle_matches))
        .route("/api/matches/:id/messages", get(handle_history))
        .route("/api/matches/:id/read", post(handle_read))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api"), state)
}

#[tokio::test]
async fn current_user_is_fetched_with_bearer_token() {
    let (base, state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base, "secret-token").expect("client");

    let me = api.fetch_current_user().await.expect("me");

    assert_eq!(me, UserId::from("u-me"));
    assert_eq!(
        state.auth_headers.lock().await.as_slice(),
        ["Bearer secret-token".to_string()]
    );
}

#[tokio::test]
async fn rejected_credential_maps_to_unauthorized_status() {
    let (base, _state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base, "wrong").expect("client");

    let err = api.fetch_current_user().await.expect_err("must fail");

    assert!(err.is_unauthorized(), "unexpected error: {err}");
    match err {
        ApiClientError::Status { body, .. } => assert!(body.contains("no token")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn conversations_are_decoded_into_directory_entries() {
    let (base, _state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base, "secret-token").expect("client");

    let conversations = api.fetch_conversations().await.expect("matches");

    assert_eq!(conversations.len(), 2);
    let first = &conversations[0];
    assert_eq!(first.unread_count, 2);
    assert_eq!(
        first.peer_of(&UserId::from("u-me")).map(|p| p.label()),
        Some("Jun (Mochi)".to_string())
    );
    assert_eq!(first.last_preview.as_ref().map(|p| p.text.as_str()), Some("hi"));
    assert!(conversations[1].last_preview.is_none());
}

#[tokio::test]
async fn history_inherits_conversation_and_drops_malformed_entries() {
    let (base, _state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base, "secret-token").expect("client");
    let conversation = ConversationId::from("m-1");

    let history = api.fetch_history(&conversation).await.expect("history");

    let ids: Vec<_> = history
        .iter()
        .filter_map(|m| m.id.as_ref().map(|id| id.as_str().to_string()))
        .collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert!(history.iter().all(|m| m.conversation_id == conversation));
    assert!(history[1].seen_by_user(&UserId::from("u-2")));
}

#[tokio::test]
async fn missing_history_maps_to_status_error() {
    let (base, _state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base, "secret-token").expect("client");

    let err = api
        .fetch_history(&ConversationId::from("missing"))
        .await
        .expect_err("must fail");

    match err {
        ApiClientError::Status { status, .. } => assert_eq!(status, reqwest::StatusCode::NOT_FOUND),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn read_receipt_posts_message_ids() {
    let (base, state) = spawn_api_server().await;
    let api = HttpChatApi::new(&base, "secret-token").expect("client");

    api.submit_read_receipt(
        &ConversationId::from("m-1"),
        &[MessageId::from("a"), MessageId::from("c")],
    )
    .await
    .expect("receipt");

    let receipts = state.receipts.lock().await;
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].0, "m-1");
    assert_eq!(receipts[0].1, json!({ "messageIds": ["a", "c"] }));
}

#[test]
fn base_without_path_support_is_rejected() {
    assert!(matches!(
        HttpChatApi::new("mailto:someone@example.com", "t"),
        Err(ApiClientError::InvalidBase { .. })
    ));
    assert!(HttpChatApi::new("not a url", "t").is_err());
}
