use super::*;

mod conversation_tests;
mod pagination_tests;
mod queue_tests;

pub(crate) mod support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::get,
        Json, Router,
    };
    use serde_json::{json, Value};
    use shared::domain::{ConversationId, EventSequence, MemberId};
    use shared::protocol::EventEnvelope;
    use tokio::net::TcpListener;

    /// Bind a throwaway service and return its base url.
    pub async fn spawn_service(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    pub fn envelope(
        seq: i64,
        kind: &str,
        cid: Option<&str>,
        from: Option<&str>,
        body: Value,
    ) -> EventEnvelope {
        EventEnvelope {
            id: EventSequence(seq),
            kind_tag: kind.to_string(),
            cid: cid.map(ConversationId::from),
            from: from.map(MemberId::from),
            timestamp: None,
            body,
            embedded: None,
        }
    }

    #[derive(Clone, Default)]
    pub struct ServiceState {
        pub v01_hits: Arc<AtomicUsize>,
        pub v03_hits: Arc<AtomicUsize>,
        pub member_me_hits: Arc<AtomicUsize>,
        /// Remaining forced failures for the members/me lookup.
        pub member_me_failures: Arc<AtomicUsize>,
        /// Remaining forced failures for conversation fetches.
        pub conversation_failures: Arc<AtomicUsize>,
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        if counter.load(Ordering::SeqCst) > 0 {
            counter.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    async fn conversation_v01(
        State(state): State<ServiceState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>, StatusCode> {
        if take_failure(&state.conversation_failures) {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        state.v01_hits.fetch_add(1, Ordering::SeqCst);
        Ok(Json(json!({ "id": id, "name": format!("room-{id}") })))
    }

    async fn conversation_v03(
        State(state): State<ServiceState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>, StatusCode> {
        if take_failure(&state.conversation_failures) {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        state.v03_hits.fetch_add(1, Ordering::SeqCst);
        Ok(Json(json!({
            "id": id,
            "name": format!("room-{id}"),
            "display_name": "Room",
            "members": []
        })))
    }

    async fn member_me(
        State(state): State<ServiceState>,
        Path(_id): Path<String>,
    ) -> Result<Json<Value>, StatusCode> {
        state.member_me_hits.fetch_add(1, Ordering::SeqCst);
        if take_failure(&state.member_me_failures) {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Ok(Json(json!({
            "id": "MEM-me",
            "user_id": "USR-self",
            "name": "self",
            "state": "JOINED"
        })))
    }

    /// Conversation-service stub covering both fetch fidelities and the
    /// own-membership lookup.
    pub fn conversation_router(state: ServiceState) -> Router {
        Router::new()
            .route("/v0.1/conversations/:id", get(conversation_v01))
            .route("/v0.3/conversations/:id", get(conversation_v03))
            .route("/v0.3/conversations/:id/members/me", get(member_me))
            .with_state(state)
    }

    pub fn self_user() -> shared::protocol::UserPayload {
        shared::protocol::UserPayload {
            id: shared::domain::UserId::from("USR-self"),
            name: "self".to_string(),
            display_name: None,
            image_url: None,
        }
    }
}
