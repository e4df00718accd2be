//! Integration test: the Omi polling channel against an in-process axum fake of the
//! developer API.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use lib::bus::MessageBus;
use lib::channels::{Channel, OmiSource, OutboundMessage};
use lib::config::OmiConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Fake {
    listings: Mutex<Vec<HashMap<String, String>>>,
    memories: Mutex<Vec<String>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer omi-key")
}

async fn list(
    State(fake): State<Arc<Fake>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let calls = {
        let mut listings = fake.listings.lock().unwrap();
        listings.push(query);
        listings.len()
    };
    let old = json!({"id": "c1", "created_at": "2026-03-01T10:00:00Z", "title": "Old chat"});
    if calls == 1 {
        return Ok(Json(json!([old])));
    }
    Ok(Json(json!([
        {
            "id": "c3",
            "created_at": "2026-03-01T10:06:00Z",
            "title": "Lunch",
            "overview": "Picked a place."
        },
        {
            "id": "c2",
            "created_at": "2026-03-01T10:05:00Z",
            "title": "Standup",
            "category": "work",
            "transcript": [{"speaker": 0, "text": "Ship it."}]
        },
        old
    ])))
}

async fn conversation(Path(id): Path<String>, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) || id != "c3" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({
        "id": "c3",
        "title": "Lunch",
        "overview": "Picked a place.",
        "transcript": [{"speaker": 1, "text": "Tacos?"}]
    })))
}

async fn create_memory(State(fake): State<Arc<Fake>>, Json(body): Json<Value>) -> Json<Value> {
    let content = body["content"].as_str().unwrap_or_default().to_string();
    fake.memories.lock().unwrap().push(content);
    Json(json!({"id": "mem-1"}))
}

async fn serve(fake: Arc<Fake>) -> SocketAddr {
    let app = Router::new()
        .route("/v1/dev/user/conversations", get(list))
        .route("/v1/dev/user/conversations/:id", get(conversation))
        .route("/v1/dev/user/memories", axum::routing::post(create_memory))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn new_conversations_are_published_once() {
    let fake = Arc::new(Fake::default());
    let addr = serve(fake.clone()).await;
    let channel = Arc::new(
        OmiSource::new(OmiConfig {
            enabled: true,
            api_key: Some("omi-key".to_string()),
            api_url: format!("http://{}/v1/dev/", addr),
            poll_interval_secs: 1,
        })
        .into_channel(),
    );
    let (bus, mut rx) = MessageBus::new(16);
    channel.clone().start(bus.publisher("omi")).unwrap();

    let lunch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first conversation")
        .expect("bus open");
    assert_eq!(lunch.sender_id, "omi-wearable");
    assert_eq!(lunch.chat_id, "c3");
    assert_eq!(
        lunch.content,
        "Conversation: Lunch\n\nPicked a place.\n\n[Speaker 1]: Tacos?"
    );

    let standup = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("second conversation")
        .expect("bus open");
    assert_eq!(standup.chat_id, "c2");
    assert_eq!(standup.metadata["category"], "work");
    assert!(standup.content.ends_with("[Speaker 0]: Ship it."));

    // the next poll returns the same listing; nothing is republished
    assert!(tokio::time::timeout(Duration::from_millis(1500), rx.recv())
        .await
        .is_err());

    channel
        .send(OutboundMessage::new("omi", "c2", "Remember: ship Friday"))
        .await;
    assert_eq!(
        *fake.memories.lock().unwrap(),
        vec!["Remember: ship Friday".to_string()]
    );

    channel.stop().await;
    assert!(!channel.is_running());

    let listings = fake.listings.lock().unwrap().clone();
    assert!(listings.len() >= 3);
    assert_eq!(listings[0]["limit"], "25");
    assert!(listings[0].get("include_transcript").is_none());
    assert_eq!(listings[1]["limit"], "10");
    assert_eq!(listings[1]["include_transcript"], "true");
}

#[tokio::test]
async fn unreachable_api_does_not_stop_the_channel() {
    let channel = Arc::new(
        OmiSource::new(OmiConfig {
            enabled: true,
            api_key: Some("omi-key".to_string()),
            api_url: "http://127.0.0.1:9/v1/dev".to_string(),
            poll_interval_secs: 1,
        })
        .into_channel(),
    );
    let (bus, mut rx) = MessageBus::new(4);
    channel.clone().start(bus.publisher("omi")).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(channel.is_running());
    assert!(rx.try_recv().is_err());
    channel.stop().await;
    assert!(!channel.is_running());
}
