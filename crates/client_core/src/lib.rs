use std::sync::{Arc, Weak};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use shared::domain::{ConversationId, EventSequence, UserId};
use shared::protocol::{
    ConversationPayload, EventBody, EventEnvelope, EventKind, NewConversationRequest, RtcSignal,
    TokenUpdateRequest, UserPayload, UserSessionPayload,
};
use tokio::sync::{broadcast, OnceCell, RwLock};
use tracing::{debug, error, warn};

pub mod cache;
pub mod calls;
pub mod conversation;
pub mod error;
pub mod http;
pub mod pagination;
pub mod queue;
pub mod session;
pub mod sync;
pub mod transport;

pub use cache::{ConversationCache, Fidelity};
pub use calls::{CallController, CallSession};
pub use conversation::{AckState, Conversation, ConversationEvent, Member};
pub use error::{ApiFailure, ClientError, PageDirection};
pub use http::{ApiClient, ApiVersion};
pub use pagination::{Page, PageFetcher, PageRequest};
pub use queue::{EventOrderingQueue, OrderedEventHandler, QueueScope};
pub use session::{ClientConfig, Session};
pub use sync::SyncProgressTracker;

use cache::ConversationListFetcher;
use pagination::HttpPageFetcher;

/// Application-level notifications raised by the sync core.
#[derive(Debug, Clone)]
pub enum ClientNotification {
    MemberInvited {
        member: Member,
        event: ConversationEvent,
    },
    MemberJoined {
        member: Member,
        event: ConversationEvent,
    },
    EventReceived {
        conversation_id: ConversationId,
        member: Option<Member>,
        event: ConversationEvent,
    },
    CallStatusChanged {
        call: CallSession,
    },
    SyncProgress {
        percent: f64,
    },
    Error(String),
}

/// Narrow acceptance interface of the SIP/RTC signaling stack. The core
/// forwards signaling events here and never looks inside them.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    async fn handle_sip_event(&self, envelope: &EventEnvelope);
    async fn handle_rtc_event(&self, envelope: &EventEnvelope);
}

pub struct MissingSignalingGateway;

#[async_trait]
impl SignalingGateway for MissingSignalingGateway {
    async fn handle_sip_event(&self, envelope: &EventEnvelope) {
        debug!(kind = %envelope.kind_tag, "no signaling gateway installed, dropping sip event");
    }

    async fn handle_rtc_event(&self, envelope: &EventEnvelope) {
        debug!(kind = %envelope.kind_tag, "no signaling gateway installed, dropping rtc event");
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewConversationParams {
    pub name: Option<String>,
    pub display_name: Option<String>,
}

/// Root aggregate: owns the session, the HTTP collaborator, the
/// conversation cache, the call controller and the notification channel,
/// and hosts the event dispatcher.
pub struct ConversationClient {
    session: Arc<Session>,
    api: Arc<ApiClient>,
    cache: Arc<ConversationCache>,
    calls: CallController,
    signaling: Arc<dyn SignalingGateway>,
    me: RwLock<Option<UserPayload>>,
    queue: OnceCell<EventOrderingQueue>,
    notifications: broadcast::Sender<ClientNotification>,
}

impl ConversationClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Self::new_with_signaling(config, Arc::new(MissingSignalingGateway))
    }

    pub fn new_with_signaling(
        config: ClientConfig,
        signaling: Arc<dyn SignalingGateway>,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(1024);
        let session = Arc::new(Session::new(config));
        let api = Arc::new(ApiClient::new(Arc::clone(&session)));
        let cache = Arc::new(ConversationCache::new(
            Arc::clone(&api),
            Arc::clone(&session),
        ));
        let calls = CallController::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            notifications.clone(),
        );
        Arc::new(Self {
            session,
            api,
            cache,
            calls,
            signaling,
            me: RwLock::new(None),
            queue: OnceCell::new(),
            notifications,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientNotification> {
        self.notifications.subscribe()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cache(&self) -> &Arc<ConversationCache> {
        &self.cache
    }

    pub fn calls(&self) -> &CallController {
        &self.calls
    }

    pub(crate) fn notifications(&self) -> &broadcast::Sender<ClientNotification> {
        &self.notifications
    }

    pub async fn current_user(&self) -> Option<UserPayload> {
        self.me.read().await.clone()
    }

    /// Resolve and remember the logged-in user's own record.
    pub async fn fetch_own_user(&self) -> Result<UserPayload, ClientError> {
        let user: UserPayload = self
            .api
            .request_as(Method::GET, "users/me", None, ApiVersion::V03)
            .await?;
        *self.me.write().await = Some(user.clone());
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &UserId) -> Result<UserPayload, ClientError> {
        self.api
            .request_as(
                Method::GET,
                &format!("users/{user_id}"),
                None,
                ApiVersion::V03,
            )
            .await
    }

    /// Entry point for every inbound realtime event, invoked in transport
    /// delivery order. With buffered delivery the event goes through the
    /// ordering queue; otherwise it is processed inline and any failure is
    /// surfaced to the caller.
    pub async fn handle_event(
        self: &Arc<Self>,
        envelope: EventEnvelope,
    ) -> Result<(), ClientError> {
        if self.session.buffer_events {
            let queue = self
                .queue
                .get_or_init(|| {
                    let handler = Arc::new(DispatchSink {
                        client: Arc::downgrade(self),
                    });
                    let notifications = self.notifications.clone();
                    async move { EventOrderingQueue::new(handler, notifications) }
                })
                .await;
            queue.enqueue(envelope);
            Ok(())
        } else {
            self.process_event(&envelope).await
        }
    }

    /// Classify, route and apply one event. For a single conversation scope
    /// this completes for event N before event N+1 begins whenever the
    /// ordering queue is in front of it.
    pub(crate) async fn process_event(
        self: &Arc<Self>,
        envelope: &EventEnvelope,
    ) -> Result<(), ClientError> {
        let kind = envelope.kind();

        // sip events belong exclusively to the signaling stack
        if kind.is_sip() {
            self.signaling.handle_sip_event(envelope).await;
            return Ok(());
        }

        let Some(conversation_id) = envelope.cid.clone() else {
            debug!(kind = %envelope.kind_tag, "ignoring event without conversation scope");
            return Ok(());
        };

        let cached = self.cache.get(&conversation_id).await;
        let re_invited = match &cached {
            Some(conversation) => conversation.is_user_re_invited(envelope).await,
            None => false,
        };
        let force_repair = kind == EventKind::Rtc(RtcSignal::Transfer);

        if let Some(conversation) = cached {
            if !re_invited && !force_repair {
                if kind.is_rtc() {
                    self.signaling.handle_rtc_event(envelope).await;
                }
                let event = conversation.apply_event(envelope).await?;
                let app_level = matches!(
                    kind,
                    EventKind::MemberInvited | EventKind::MemberJoined
                ) && self.is_event_from_me(envelope).await;
                self.emit_event_notifications(&conversation, envelope, &event, app_level)
                    .await;
                return Ok(());
            }
        }

        // repair path: the conversation is unknown or its membership state
        // is stale relative to the event
        if re_invited {
            self.cache.evict(&conversation_id).await;
        }
        let fidelity = if envelope.is_call_path() {
            Fidelity::Summary
        } else {
            Fidelity::Full
        };
        let conversation = self
            .cache
            .fetch(&conversation_id, fidelity)
            .await
            .map_err(|source| ClientError::Reconciliation {
                conversation_id: conversation_id.clone(),
                source: Box::new(source),
            })?;
        let event = conversation.apply_event(envelope).await.map_err(|source| {
            ClientError::Reconciliation {
                conversation_id: conversation_id.clone(),
                source: Box::new(source),
            }
        })?;
        self.emit_event_notifications(&conversation, envelope, &event, true)
            .await;
        if kind.is_rtc() {
            self.signaling.handle_rtc_event(envelope).await;
        }
        Ok(())
    }

    async fn is_event_from_me(&self, envelope: &EventEnvelope) -> bool {
        let Some(me) = self.me.read().await.as_ref().map(|user| user.id.clone()) else {
            return false;
        };
        envelope.acting_user_id() == Some(me)
    }

    /// Per-type event notification plus, at application level, the
    /// member-carrying invited/joined notifications and draft-call
    /// promotion.
    async fn emit_event_notifications(
        &self,
        conversation: &Arc<Conversation>,
        envelope: &EventEnvelope,
        event: &ConversationEvent,
        app_level: bool,
    ) {
        let member = self
            .resolve_event_member(conversation, envelope, app_level)
            .await;

        let _ = self.notifications.send(ClientNotification::EventReceived {
            conversation_id: conversation.id.clone(),
            member: member.clone(),
            event: event.clone(),
        });

        if !app_level {
            return;
        }

        if let EventBody::MemberInvited(lifecycle) = &event.body {
            if let Some(knocking_id) = &lifecycle.knocking_id {
                if let Some(call) = self
                    .calls
                    .promote_draft(knocking_id, Arc::clone(conversation))
                    .await
                {
                    let _ = self
                        .notifications
                        .send(ClientNotification::CallStatusChanged { call });
                }
            }
        }

        match (&event.kind, member) {
            (EventKind::MemberInvited, Some(member)) => {
                let _ = self.notifications.send(ClientNotification::MemberInvited {
                    member,
                    event: event.clone(),
                });
            }
            (EventKind::MemberJoined, Some(member)) => {
                let _ = self.notifications.send(ClientNotification::MemberJoined {
                    member,
                    event: event.clone(),
                });
            }
            _ => {}
        }
    }

    /// Member resolution ladder: the conversation's member map first, then
    /// an explicit fetch when raising at application level; a failed fetch
    /// degrades with a warning.
    async fn resolve_event_member(
        &self,
        conversation: &Arc<Conversation>,
        envelope: &EventEnvelope,
        allow_fetch: bool,
    ) -> Option<Member> {
        let member_id = envelope.from.as_ref()?;
        if let Some(member) = conversation.member(member_id).await {
            return Some(member);
        }
        if allow_fetch {
            match conversation.fetch_member(&self.api, member_id).await {
                Ok(member) => return Some(member),
                Err(err) => warn!(
                    conversation_id = %conversation.id,
                    member_id = %member_id,
                    error = %err,
                    "failed to resolve event member"
                ),
            }
        }
        None
    }

    /// Fetch-or-create a conversation at the requested fidelity.
    pub async fn get_conversation(
        &self,
        id: &ConversationId,
        fidelity: Fidelity,
    ) -> Result<Arc<Conversation>, ClientError> {
        self.cache.fetch(id, fidelity).await
    }

    /// Paginated listing of the logged-in user's conversations; items are
    /// merged into the cache.
    pub async fn get_conversations(
        &self,
        request: Option<PageRequest>,
    ) -> Result<Page<ConversationPayload>, ClientError> {
        let me = self
            .current_user()
            .await
            .ok_or(ClientError::NoSession("own user not loaded"))?;
        let fetcher = Arc::new(ConversationListFetcher {
            api: Arc::clone(&self.api),
            cache: Arc::clone(&self.cache),
            path: format!("users/{}/conversations", me.id),
        });
        fetcher
            .fetch_page(request.unwrap_or_else(|| self.session.page_defaults()))
            .await
    }

    /// Paginated event history of one conversation.
    pub async fn get_events(
        &self,
        conversation_id: &ConversationId,
        request: Option<PageRequest>,
    ) -> Result<Page<EventEnvelope>, ClientError> {
        let conversation = self.cache.get_or_create(conversation_id).await;
        conversation
            .get_events(
                &self.api,
                request.unwrap_or_else(|| self.session.page_defaults()),
            )
            .await
    }

    /// Paginated member listing of one conversation.
    pub async fn get_members(
        &self,
        conversation_id: &ConversationId,
        request: Option<PageRequest>,
    ) -> Result<Page<shared::protocol::MemberPayload>, ClientError> {
        let conversation = self.cache.get_or_create(conversation_id).await;
        conversation
            .get_members(
                &self.api,
                request.unwrap_or_else(|| self.session.page_defaults()),
            )
            .await
    }

    /// Paginated listing of a user's sessions (defaults to the logged-in
    /// user).
    pub async fn get_user_sessions(
        &self,
        user_id: Option<&UserId>,
        request: Option<PageRequest>,
    ) -> Result<Page<UserSessionPayload>, ClientError> {
        let user_id = match user_id {
            Some(user_id) => user_id.clone(),
            None => {
                self.current_user()
                    .await
                    .ok_or(ClientError::NoSession("own user not loaded"))?
                    .id
            }
        };
        let fetcher = HttpPageFetcher::new(
            Arc::clone(&self.api),
            format!("users/{user_id}/sessions"),
            ApiVersion::V03,
        );
        fetcher
            .fetch_page(request.unwrap_or_else(|| self.session.page_defaults()))
            .await
    }

    /// Create a conversation, install it in the cache and re-fetch the
    /// canonical full representation.
    pub async fn new_conversation(
        &self,
        params: NewConversationParams,
    ) -> Result<Arc<Conversation>, ClientError> {
        let request = NewConversationRequest {
            name: params
                .name
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            display_name: params.display_name,
        };
        let body = serde_json::to_value(&request)
            .map_err(|source| ClientError::decode("conversation request", source))?;
        let payload: ConversationPayload = self
            .api
            .request_as(Method::POST, "conversations", Some(body), ApiVersion::V03)
            .await?;
        let conversation = self.cache.get_or_create(&payload.id).await;
        conversation.merge_payload(&payload).await;
        self.cache.fetch(&payload.id, Fidelity::Full).await
    }

    pub async fn new_conversation_and_join(
        &self,
        params: NewConversationParams,
    ) -> Result<Arc<Conversation>, ClientError> {
        let conversation = self.new_conversation(params).await?;
        self.join_conversation(&conversation.id).await?;
        Ok(conversation)
    }

    /// Join a conversation as the logged-in user.
    pub async fn join_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Member, ClientError> {
        let me = self
            .current_user()
            .await
            .ok_or(ClientError::NoSession("own user not loaded"))?;
        let body = json!({ "user_id": me.id, "action": "join" });
        let payload: shared::protocol::MemberPayload = self
            .api
            .request_as(
                Method::POST,
                &format!("conversations/{conversation_id}/members"),
                Some(body),
                ApiVersion::V03,
            )
            .await?;
        let conversation = self.cache.get_or_create(conversation_id).await;
        Ok(conversation.adopt_member(&payload, true).await)
    }

    /// Refresh the authentication token. While disconnected the new token
    /// is stored for the next reconnect attempt; otherwise it is pushed to
    /// the active session first.
    pub async fn update_token(&self, token: &str) -> Result<(), ClientError> {
        if !self.session.is_connected() {
            self.session.set_token(token).await;
            return Ok(());
        }
        let session_id = self
            .session
            .session_id()
            .await
            .ok_or(ClientError::NoSession("no realtime session established"))?;
        let body = serde_json::to_value(TokenUpdateRequest {
            token: token.to_string(),
        })
        .map_err(|source| ClientError::decode("token request", source))?;
        self.api
            .request(
                Method::PUT,
                &format!("sessions/{session_id}"),
                Some(body),
                ApiVersion::V03,
            )
            .await?;
        self.session.set_token(token).await;
        Ok(())
    }

    /// Sequentially load every listed conversation into the cache,
    /// emitting progress notifications along the way.
    pub async fn sync_conversations(
        &self,
        conversations: &[ConversationId],
    ) -> Result<(), ClientError> {
        SyncProgressTracker::new(Arc::clone(&self.cache), self.notifications.clone())
            .run(conversations)
            .await
    }

    /// Look up one applied event by conversation and sequence.
    pub async fn applied_event(
        &self,
        conversation_id: &ConversationId,
        sequence: EventSequence,
    ) -> Option<ConversationEvent> {
        self.cache.get(conversation_id).await?.event(sequence).await
    }

    /// Install the logged-in user without a round trip; integration wiring
    /// uses this when the identity arrives with the session handshake.
    pub async fn set_current_user(&self, user: UserPayload) {
        *self.me.write().await = Some(user);
    }
}

/// Queue-side handler: holds the aggregate weakly so a live queue never
/// keeps the client alive.
struct DispatchSink {
    client: Weak<ConversationClient>,
}

#[async_trait]
impl OrderedEventHandler for DispatchSink {
    async fn process(&self, envelope: EventEnvelope) -> Result<(), ClientError> {
        match self.client.upgrade() {
            Some(client) => {
                let result = client.process_event(&envelope).await;
                if let Err(err) = &result {
                    error!(
                        kind = %envelope.kind_tag,
                        error = %err,
                        "dropping event after failed processing"
                    );
                }
                result
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests;
