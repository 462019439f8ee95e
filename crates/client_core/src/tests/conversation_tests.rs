use super::support::envelope;
use super::*;
use serde_json::json;
use shared::domain::{CallStatus, ConversationId, EventSequence, MemberId, MemberState};
use shared::protocol::EventBody;

fn conversation() -> std::sync::Arc<Conversation> {
    Conversation::new(ConversationId::from("CON-1"))
}

fn text_event(seq: i64, text: &str) -> shared::protocol::EventEnvelope {
    envelope(
        seq,
        "text",
        Some("CON-1"),
        Some("MEM-a"),
        json!({ "text": text }),
    )
}

#[tokio::test]
async fn applying_the_same_event_twice_is_idempotent() {
    let conversation = conversation();

    let first = conversation
        .apply_event(&text_event(1, "hello"))
        .await
        .expect("apply");
    let second = conversation
        .apply_event(&text_event(1, "hello"))
        .await
        .expect("re-apply");

    assert_eq!(first, second);
    let state = conversation.snapshot().await;
    assert_eq!(state.events.len(), 1);
}

#[tokio::test]
async fn receipts_accumulate_once_per_member() {
    let conversation = conversation();
    conversation
        .apply_event(&text_event(1, "hello"))
        .await
        .expect("apply");

    let seen = envelope(
        2,
        "text:seen",
        Some("CON-1"),
        Some("MEM-b"),
        json!({ "event_id": 1, "timestamp": "2024-05-01T10:00:00Z" }),
    );
    conversation.apply_event(&seen).await.expect("seen");
    conversation.apply_event(&seen).await.expect("seen again");

    let target = conversation
        .event(EventSequence(1))
        .await
        .expect("target event");
    assert_eq!(target.state.seen_by.len(), 1);
    assert!(target.state.seen_by.contains_key(&MemberId::from("MEM-b")));
    assert!(target.state.delivered_to.is_empty());
}

#[tokio::test]
async fn receipt_for_unknown_event_is_ignored() {
    let conversation = conversation();
    let seen = envelope(
        5,
        "message:delivered",
        Some("CON-1"),
        Some("MEM-b"),
        json!({ "event_id": 99 }),
    );
    conversation.apply_event(&seen).await.expect("no-op");
    assert!(conversation.snapshot().await.events.is_empty());
}

#[tokio::test]
async fn member_lifecycle_transitions_update_the_member_map() {
    let conversation = conversation();
    let user = json!({ "user": { "id": "USR-9", "name": "nina" } });

    conversation
        .apply_event(&envelope(1, "member:invited", Some("CON-1"), Some("MEM-9"), user.clone()))
        .await
        .expect("invited");
    let member = conversation
        .member(&MemberId::from("MEM-9"))
        .await
        .expect("member");
    assert_eq!(member.state, MemberState::Invited);

    conversation
        .apply_event(&envelope(2, "member:joined", Some("CON-1"), Some("MEM-9"), user.clone()))
        .await
        .expect("joined");
    let member = conversation
        .member(&MemberId::from("MEM-9"))
        .await
        .expect("member");
    assert_eq!(member.state, MemberState::Joined);

    conversation
        .apply_event(&envelope(3, "member:left", Some("CON-1"), Some("MEM-9"), user))
        .await
        .expect("left");
    let member = conversation
        .member(&MemberId::from("MEM-9"))
        .await
        .expect("member");
    assert_eq!(member.state, MemberState::Left);
    assert!(!member.state.is_active());
}

#[tokio::test]
async fn member_event_without_member_id_is_a_decode_error() {
    let conversation = conversation();
    let event = envelope(
        1,
        "member:joined",
        Some("CON-1"),
        None,
        json!({ "user": { "id": "USR-9" } }),
    );
    let err = conversation.apply_event(&event).await.expect_err("rejected");
    assert!(matches!(err, ClientError::Decode { .. }));
}

#[tokio::test]
async fn malformed_known_body_is_a_decode_error() {
    let conversation = conversation();
    let event = envelope(1, "text", Some("CON-1"), Some("MEM-a"), json!({ "bogus": 1 }));
    let err = conversation.apply_event(&event).await.expect_err("rejected");
    assert!(matches!(err, ClientError::Decode { .. }));
}

#[tokio::test]
async fn unknown_event_tags_are_kept_as_generic_events() {
    let conversation = conversation();
    let event = envelope(
        1,
        "audio:play",
        Some("CON-1"),
        Some("MEM-a"),
        json!({ "stream": 3 }),
    );
    let applied = conversation.apply_event(&event).await.expect("apply");
    assert!(matches!(applied.body, EventBody::Generic { .. }));
}

#[tokio::test]
async fn deleting_an_event_leaves_a_tombstone() {
    let conversation = conversation();
    conversation
        .apply_event(&text_event(1, "oops"))
        .await
        .expect("apply");
    conversation
        .apply_event(&envelope(
            2,
            "event:delete",
            Some("CON-1"),
            Some("MEM-a"),
            json!({ "event_id": 1 }),
        ))
        .await
        .expect("delete");

    let target = conversation.event(EventSequence(1)).await.expect("event");
    assert_eq!(target.body, EventBody::Deleted);
}

#[tokio::test]
async fn call_status_derivation_prefers_answered_over_ringing() {
    let conversation = conversation();
    assert_eq!(conversation.derive_call_status().await, CallStatus::Started);

    conversation
        .apply_event(&envelope(1, "sip:ringing", Some("CON-1"), Some("MEM-a"), json!({})))
        .await
        .expect("ringing");
    assert_eq!(conversation.derive_call_status().await, CallStatus::Ringing);

    conversation
        .apply_event(&envelope(2, "sip:answered", Some("CON-1"), Some("MEM-a"), json!({})))
        .await
        .expect("answered");
    assert_eq!(conversation.derive_call_status().await, CallStatus::Answered);
}

#[tokio::test]
async fn ordered_application_matches_one_at_a_time_state() {
    let conversation = conversation();
    let events = vec![
        text_event(1, "one"),
        envelope(
            2,
            "text:delivered",
            Some("CON-1"),
            Some("MEM-b"),
            json!({ "event_id": 1 }),
        ),
        envelope(
            3,
            "text:seen",
            Some("CON-1"),
            Some("MEM-b"),
            json!({ "event_id": 1 }),
        ),
        text_event(4, "two"),
    ];
    for event in &events {
        conversation.apply_event(event).await.expect("apply");
    }

    let state = conversation.snapshot().await;
    assert_eq!(state.events.len(), 2);
    let first = &state.events[&EventSequence(1)];
    assert_eq!(first.state.delivered_to.len(), 1);
    assert_eq!(first.state.seen_by.len(), 1);
    let sequences: Vec<i64> = state.events.keys().map(|sequence| sequence.0).collect();
    assert_eq!(sequences, vec![1, 4]);
}
