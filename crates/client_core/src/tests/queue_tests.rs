use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use shared::domain::{ConversationId, EventSequence, MemberId};
use shared::protocol::EventEnvelope;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};

use super::support::{envelope, spawn_service};
use super::*;

struct Recorder {
    log: Arc<Mutex<Vec<(Option<String>, i64)>>>,
    slow_on: Option<i64>,
    fail_on: Option<i64>,
}

impl Recorder {
    fn new() -> (Self, Arc<Mutex<Vec<(Option<String>, i64)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                log: log.clone(),
                slow_on: None,
                fail_on: None,
            },
            log,
        )
    }
}

#[async_trait]
impl OrderedEventHandler for Recorder {
    async fn process(&self, envelope: EventEnvelope) -> Result<(), ClientError> {
        if self.slow_on == Some(envelope.id.0) {
            sleep(Duration::from_millis(150)).await;
        }
        if self.fail_on == Some(envelope.id.0) {
            return Err(ClientError::invalid_params("injected failure"));
        }
        self.log.lock().await.push((
            envelope.cid.as_ref().map(ToString::to_string),
            envelope.id.0,
        ));
        Ok(())
    }
}

async fn wait_for_entries(log: &Arc<Mutex<Vec<(Option<String>, i64)>>>, count: usize) {
    timeout(Duration::from_secs(2), async {
        loop {
            if log.lock().await.len() >= count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue drained in time");
}

#[tokio::test]
async fn same_scope_events_are_processed_strictly_in_order() {
    let (mut recorder, log) = Recorder::new();
    recorder.slow_on = Some(1);
    let (notifications, _keepalive) = broadcast::channel(16);
    let queue = EventOrderingQueue::new(Arc::new(recorder), notifications);

    for seq in 1..=3 {
        queue.enqueue(envelope(seq, "text", Some("CON-A"), Some("MEM-a"), json!({ "text": "x" })));
    }
    wait_for_entries(&log, 3).await;

    let sequences: Vec<i64> = log.lock().await.iter().map(|(_, seq)| *seq).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn handler_failure_is_surfaced_and_the_lane_continues() {
    let (mut recorder, log) = Recorder::new();
    recorder.fail_on = Some(2);
    let (notifications, mut rx) = broadcast::channel(16);
    let queue = EventOrderingQueue::new(Arc::new(recorder), notifications);

    for seq in 1..=3 {
        queue.enqueue(envelope(seq, "text", Some("CON-A"), Some("MEM-a"), json!({ "text": "x" })));
    }
    wait_for_entries(&log, 2).await;

    let sequences: Vec<i64> = log.lock().await.iter().map(|(_, seq)| *seq).collect();
    assert_eq!(sequences, vec![1, 3]);

    let surfaced = timeout(Duration::from_secs(2), async {
        loop {
            if let ClientNotification::Error(message) = rx.recv().await.expect("channel open") {
                return message;
            }
        }
    })
    .await
    .expect("error surfaced");
    assert!(surfaced.contains("injected failure"));
}

#[tokio::test]
async fn different_scopes_may_interleave() {
    let (mut recorder, log) = Recorder::new();
    recorder.slow_on = Some(1);
    let (notifications, _keepalive) = broadcast::channel(16);
    let queue = EventOrderingQueue::new(Arc::new(recorder), notifications);

    queue.enqueue(envelope(1, "text", Some("CON-A"), Some("MEM-a"), json!({ "text": "x" })));
    queue.enqueue(envelope(2, "text", Some("CON-B"), Some("MEM-b"), json!({ "text": "y" })));
    wait_for_entries(&log, 2).await;

    // the slow lane must not hold up the other scope
    let first = log.lock().await.first().cloned().expect("entry");
    assert_eq!(first, (Some("CON-B".to_string()), 2));
}

#[tokio::test]
async fn events_without_a_conversation_share_the_global_lane() {
    let unscoped = envelope(9, "text", None, Some("MEM-a"), json!({ "text": "x" }));
    assert_eq!(QueueScope::for_event(&unscoped), QueueScope::Global);
    let scoped = envelope(10, "text", Some("CON-Z"), None, json!({ "text": "x" }));
    assert_eq!(
        QueueScope::for_event(&scoped),
        QueueScope::Conversation(ConversationId::from("CON-Z"))
    );
}

#[tokio::test]
async fn buffered_dispatch_keeps_order_across_a_reconciliation_fetch() {
    let slow_conversations = Router::new()
        .route(
            "/v0.3/conversations/:id",
            get(|Path(id): Path<String>| async move {
                // suspend long enough for the second event to race ahead if
                // ordering were broken
                sleep(Duration::from_millis(100)).await;
                Json(json!({ "id": id, "name": "slow-room", "members": [] }))
            }),
        )
        .route(
            "/v0.3/conversations/:id/members/me",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "code": "not_found", "message": "no membership" })),
                )
            }),
        );
    let url = spawn_service(slow_conversations).await;
    let client = ConversationClient::new(ClientConfig::new(url, "token"));
    let conversation_id = ConversationId::from("CON-Q");

    client
        .handle_event(envelope(
            1,
            "text",
            Some("CON-Q"),
            Some("MEM-a"),
            json!({ "text": "hello" }),
        ))
        .await
        .expect("enqueued");
    client
        .handle_event(envelope(
            2,
            "text:seen",
            Some("CON-Q"),
            Some("MEM-b"),
            json!({ "event_id": 1 }),
        ))
        .await
        .expect("enqueued");

    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(event) = client
                .applied_event(&conversation_id, EventSequence(1))
                .await
            {
                if event.state.seen_by.contains_key(&MemberId::from("MEM-b")) {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("receipt applied after the repair fetch, in order");
}
