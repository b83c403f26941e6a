use super::*;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize as DeserializeDerive;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct TestServerState {
    fetch_queries: Arc<Mutex<Vec<(String, String)>>>,
    inserted: Arc<Mutex<Vec<MessageRecord>>>,
    read_updates: Arc<Mutex<Vec<(String, String)>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<(String, usize)>>>,
}

#[derive(DeserializeDerive)]
struct FetchQuery {
    user_a: String,
    user_b: String,
}

async fn handle_fetch(
    State(state): State<TestServerState>,
    Query(query): Query<FetchQuery>,
) -> Json<Vec<MessageRecord>> {
    state
        .fetch_queries
        .lock()
        .await
        .push((query.user_a.clone(), query.user_b.clone()));
    Json(vec![MessageRecord {
        id: MessageId("m1".into()),
        sender: PeerId::new(query.user_b),
        receiver: PeerId::new(query.user_a),
        text: Some("from the wire".into()),
        image_url: None,
        audio_url: None,
        created_at: None,
        is_read: false,
    }])
}

async fn handle_insert(
    State(state): State<TestServerState>,
    Json(record): Json<MessageRecord>,
) -> Json<MessageRecord> {
    state.inserted.lock().await.push(record.clone());
    // the canonical row keeps the client id
    Json(record)
}

#[derive(DeserializeDerive)]
struct ReadQuery {
    reader: String,
    sender: String,
}

async fn handle_read(
    State(state): State<TestServerState>,
    Query(query): Query<ReadQuery>,
) -> StatusCode {
    state
        .read_updates
        .lock()
        .await
        .push((query.reader, query.sender));
    StatusCode::NO_CONTENT
}

async fn handle_delete(
    State(state): State<TestServerState>,
    Path(id): Path<String>,
) -> StatusCode {
    state.deleted.lock().await.push(id);
    StatusCode::NO_CONTENT
}

async fn handle_upload(
    State(state): State<TestServerState>,
    Path(name): Path<String>,
    body: axum::body::Bytes,
) -> Json<serde_json::Value> {
    state.uploads.lock().await.push((name.clone(), body.len()));
    Json(serde_json::json!({ "url": format!("https://cdn.example/media/{name}") }))
}

async fn spawn_test_server() -> Result<(String, TestServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = TestServerState::default();
    let app = Router::new()
        .route("/messages", get(handle_fetch))
        .route("/messages", post(handle_insert))
        .route("/messages/read", post(handle_read))
        .route("/messages/:id", delete(handle_delete))
        .route("/media/:name", post(handle_upload))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn sample_outbound() -> MessageRecord {
    MessageRecord {
        id: MessageId("m-out".into()),
        sender: PeerId::new("shoe@gmail.com"),
        receiver: PeerId::new("socks@gmail.com"),
        text: Some("over the wire".into()),
        image_url: None,
        audio_url: None,
        created_at: None,
        is_read: false,
    }
}

#[tokio::test]
async fn fetch_conversation_sends_the_pair_and_decodes_rows() {
    let (server_url, state) = spawn_test_server().await.expect("spawn server");
    let store = RestDurableStore::new(&server_url).expect("store");
    let conversation =
        ConversationKey::new(PeerId::new("shoe@gmail.com"), PeerId::new("socks@gmail.com"));

    let records = store
        .fetch_conversation(&conversation)
        .await
        .expect("fetch");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id.as_str(), "m1");
    assert_eq!(
        state.fetch_queries.lock().await.clone(),
        vec![("shoe@gmail.com".to_string(), "socks@gmail.com".to_string())]
    );
}

#[tokio::test]
async fn insert_message_posts_the_record_and_returns_the_confirmation() {
    let (server_url, state) = spawn_test_server().await.expect("spawn server");
    let store = RestDurableStore::new(&server_url).expect("store");

    let confirmed = store
        .insert_message(&sample_outbound())
        .await
        .expect("insert");

    assert_eq!(confirmed.id.as_str(), "m-out");
    let inserted = state.inserted.lock().await.clone();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].text.as_deref(), Some("over the wire"));
}

#[tokio::test]
async fn update_read_flag_targets_the_read_endpoint() {
    let (server_url, state) = spawn_test_server().await.expect("spawn server");
    let store = RestDurableStore::new(&server_url).expect("store");

    store
        .update_read_flag(&PeerId::new("shoe@gmail.com"), &PeerId::new("socks@gmail.com"))
        .await
        .expect("update");

    assert_eq!(
        state.read_updates.lock().await.clone(),
        vec![("shoe@gmail.com".to_string(), "socks@gmail.com".to_string())]
    );
}

#[tokio::test]
async fn delete_message_addresses_the_row_by_id() {
    let (server_url, state) = spawn_test_server().await.expect("spawn server");
    let store = RestDurableStore::new(&server_url).expect("store");

    store
        .delete_message(&MessageId("m-gone".into()))
        .await
        .expect("delete");

    assert_eq!(state.deleted.lock().await.clone(), vec!["m-gone".to_string()]);
}

#[tokio::test]
async fn insert_surfaces_http_errors() {
    // nothing is listening on this port by construction
    let store = RestDurableStore::new("http://127.0.0.1:1").expect("store");
    let err = store
        .insert_message(&sample_outbound())
        .await
        .expect_err("must fail");
    assert!(!err.to_string().is_empty());
}

#[tokio::test]
async fn media_upload_returns_the_public_reference() {
    let (server_url, state) = spawn_test_server().await.expect("spawn server");
    let media = RestMediaStore::new(&server_url).expect("media store");

    let url = media
        .upload(vec![1, 2, 3], "voice note.webm")
        .await
        .expect("upload");

    assert_eq!(url, "https://cdn.example/media/voice_note.webm");
    assert_eq!(
        state.uploads.lock().await.clone(),
        vec![("voice_note.webm".to_string(), 3usize)]
    );
}

#[test]
fn filenames_are_restricted_to_a_safe_alphabet() {
    assert_eq!(sanitize_filename("holiday pic.jpg"), "holiday_pic.jpg");
    assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
    assert_eq!(sanitize_filename("¡!"), "upload.bin");
    assert_eq!(sanitize_filename("plain.webm"), "plain.webm");
}

#[test]
fn base_urls_join_without_losing_the_last_segment() {
    let with_slash = parse_base_url("http://example.com/api/").expect("url");
    let without_slash = parse_base_url("http://example.com/api").expect("url");
    assert_eq!(
        with_slash.join("messages").expect("join").as_str(),
        without_slash.join("messages").expect("join").as_str()
    );
}
