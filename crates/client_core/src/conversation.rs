use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use shared::domain::{
    CallStatus, ConversationId, EventSequence, MemberId, MemberState, UserId,
};
use shared::protocol::{
    require_member_id, ConversationPayload, EventBody, EventEnvelope, EventKind,
    MemberLifecycleBody, MemberPayload, PageResponse, ReceiptStatus, SipSignal,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::http::{ApiClient, ApiVersion};
use crate::pagination::{Page, PageFetcher, PageRequest};

/// A user's participation record within one conversation. The owning
/// conversation is referenced by id, never owned.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: MemberId,
    pub user_id: UserId,
    pub name: Option<String>,
    pub state: MemberState,
    pub invited_by: Option<String>,
    pub conversation_id: ConversationId,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Member {
    fn from_payload(conversation_id: &ConversationId, payload: &MemberPayload) -> Self {
        Self {
            id: payload.id.clone(),
            user_id: payload.user_id.clone(),
            name: payload.name.clone(),
            state: payload.state,
            invited_by: payload.invited_by.clone(),
            conversation_id: conversation_id.clone(),
            updated_at: payload.timestamp,
        }
    }
}

/// Per-member acknowledgement maps accumulated on an event. Recording is
/// idempotent: the first acknowledgement from a member wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckState {
    pub seen_by: HashMap<MemberId, Option<DateTime<Utc>>>,
    pub delivered_to: HashMap<MemberId, Option<DateTime<Utc>>>,
    pub submitted_to: HashMap<MemberId, Option<DateTime<Utc>>>,
    pub rejected_by: HashMap<MemberId, Option<DateTime<Utc>>>,
    pub undeliverable_to: HashMap<MemberId, Option<DateTime<Utc>>>,
}

impl AckState {
    fn record(&mut self, status: ReceiptStatus, member: MemberId, timestamp: Option<DateTime<Utc>>) {
        let map = match status {
            ReceiptStatus::Seen => &mut self.seen_by,
            ReceiptStatus::Delivered => &mut self.delivered_to,
            ReceiptStatus::Submitted => &mut self.submitted_to,
            ReceiptStatus::Rejected => &mut self.rejected_by,
            ReceiptStatus::Undeliverable => &mut self.undeliverable_to,
        };
        map.entry(member).or_insert(timestamp);
    }
}

/// One applied event in a conversation's timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEvent {
    pub sequence: EventSequence,
    pub kind: EventKind,
    pub from: Option<MemberId>,
    pub timestamp: Option<DateTime<Utc>>,
    pub body: EventBody,
    pub state: AckState,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub members: HashMap<MemberId, Member>,
    pub events: BTreeMap<EventSequence, ConversationEvent>,
    pub my_member_id: Option<MemberId>,
}

/// A persistent multi-party channel. The handle is shared; interior state
/// is updated in place so references held by consumers stay valid across
/// merges.
#[derive(Debug)]
pub struct Conversation {
    pub id: ConversationId,
    state: RwLock<ConversationState>,
}

impl Conversation {
    pub(crate) fn new(id: ConversationId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: RwLock::new(ConversationState::default()),
        })
    }

    pub async fn snapshot(&self) -> ConversationState {
        self.state.read().await.clone()
    }

    pub async fn member(&self, member_id: &MemberId) -> Option<Member> {
        self.state.read().await.members.get(member_id).cloned()
    }

    pub async fn member_for_user(&self, user_id: &UserId) -> Option<Member> {
        self.state
            .read()
            .await
            .members
            .values()
            .find(|member| &member.user_id == user_id)
            .cloned()
    }

    pub async fn my_member(&self) -> Option<Member> {
        let state = self.state.read().await;
        let member_id = state.my_member_id.as_ref()?;
        state.members.get(member_id).cloned()
    }

    pub async fn event(&self, sequence: EventSequence) -> Option<ConversationEvent> {
        self.state.read().await.events.get(&sequence).cloned()
    }

    pub(crate) async fn set_my_member(&self, member: Member) {
        let mut state = self.state.write().await;
        state.my_member_id = Some(member.id.clone());
        state.members.insert(member.id.clone(), member);
    }

    /// Merge a server representation into this entry. Fields the payload
    /// does not carry are left untouched.
    pub(crate) async fn merge_payload(&self, payload: &ConversationPayload) {
        let mut state = self.state.write().await;
        if payload.name.is_some() {
            state.name = payload.name.clone();
        }
        if payload.display_name.is_some() {
            state.display_name = payload.display_name.clone();
        }
        for member in &payload.members {
            state
                .members
                .insert(member.id.clone(), Member::from_payload(&self.id, member));
        }
    }

    pub(crate) async fn adopt_member(&self, payload: &MemberPayload, mine: bool) -> Member {
        let member = Member::from_payload(&self.id, payload);
        let mut state = self.state.write().await;
        state.members.insert(member.id.clone(), member.clone());
        if mine {
            state.my_member_id = Some(member.id.clone());
        }
        member
    }

    /// Append/merge one event. Idempotent: re-applying an already-seen
    /// sequence neither duplicates the timeline entry nor its
    /// acknowledgement entries.
    pub async fn apply_event(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<ConversationEvent, ClientError> {
        let kind = envelope.kind();
        let body = EventBody::decode(&kind, &envelope.body).map_err(|source| {
            ClientError::decode(format!("{} event body", envelope.kind_tag), source)
        })?;

        let mut state = self.state.write().await;
        match &body {
            EventBody::MemberInvited(lifecycle) => {
                let member_id = require_member_id(envelope).map_err(|source| {
                    ClientError::decode(format!("{} event body", envelope.kind_tag), source)
                })?;
                upsert_member(
                    &mut state,
                    &self.id,
                    member_id,
                    lifecycle,
                    MemberState::Invited,
                    envelope.timestamp,
                );
            }
            EventBody::MemberJoined(lifecycle) => {
                let member_id = require_member_id(envelope).map_err(|source| {
                    ClientError::decode(format!("{} event body", envelope.kind_tag), source)
                })?;
                upsert_member(
                    &mut state,
                    &self.id,
                    member_id,
                    lifecycle,
                    MemberState::Joined,
                    envelope.timestamp,
                );
            }
            EventBody::MemberLeft(lifecycle) => {
                let member_id = require_member_id(envelope).map_err(|source| {
                    ClientError::decode(format!("{} event body", envelope.kind_tag), source)
                })?;
                upsert_member(
                    &mut state,
                    &self.id,
                    member_id,
                    lifecycle,
                    MemberState::Left,
                    envelope.timestamp,
                );
            }
            EventBody::Receipt(receipt) => {
                let target_id = receipt.event_id;
                let receipt_timestamp = receipt.timestamp;
                match (envelope.from.clone(), &kind) {
                    (Some(member_id), EventKind::Receipt(status)) => {
                        match state.events.get_mut(&target_id) {
                            Some(target) => {
                                target.state.record(*status, member_id, receipt_timestamp)
                            }
                            None => debug!(
                                conversation_id = %self.id,
                                event_id = %target_id,
                                "receipt for unknown event ignored"
                            ),
                        }
                    }
                    _ => debug!(
                        conversation_id = %self.id,
                        kind = %envelope.kind_tag,
                        "receipt without a member id ignored"
                    ),
                }
                return Ok(ephemeral_event(envelope, kind, body));
            }
            EventBody::EventDeleted(target_ref) => {
                let target_id = target_ref.event_id;
                if let Some(target) = state.events.get_mut(&target_id) {
                    target.body = EventBody::Deleted;
                }
                return Ok(ephemeral_event(envelope, kind, body));
            }
            _ => {}
        }

        let stored = state
            .events
            .entry(envelope.id)
            .or_insert_with(|| ConversationEvent {
                sequence: envelope.id,
                kind,
                from: envelope.from.clone(),
                timestamp: envelope.timestamp,
                body,
                state: AckState::default(),
            })
            .clone();
        Ok(stored)
    }

    /// Re-invite staleness: the event claims an invite/join for a user whose
    /// cached member is no longer in an active state.
    pub(crate) async fn is_user_re_invited(&self, envelope: &EventEnvelope) -> bool {
        if !matches!(
            envelope.kind(),
            EventKind::MemberInvited | EventKind::MemberJoined
        ) {
            return false;
        }
        let Some(user_id) = envelope.acting_user_id() else {
            return false;
        };
        let state = self.state.read().await;
        state
            .members
            .values()
            .find(|member| member.user_id == user_id)
            .map(|member| !member.state.is_active())
            .unwrap_or(false)
    }

    /// Initial call status for a leg reconnecting to this conversation,
    /// derived from the accumulated signaling timeline.
    pub async fn derive_call_status(&self) -> CallStatus {
        let state = self.state.read().await;
        let mut ringing = false;
        for event in state.events.values() {
            match event.kind {
                EventKind::Sip(SipSignal::Answered) => return CallStatus::Answered,
                EventKind::Sip(SipSignal::Ringing) => ringing = true,
                _ => {}
            }
        }
        if ringing {
            CallStatus::Ringing
        } else {
            CallStatus::Started
        }
    }

    pub async fn fetch_member(
        &self,
        api: &ApiClient,
        member_id: &MemberId,
    ) -> Result<Member, ClientError> {
        let path = format!("conversations/{}/members/{}", self.id, member_id);
        let payload: MemberPayload = api
            .request_as(Method::GET, &path, None, ApiVersion::V03)
            .await?;
        Ok(self.adopt_member(&payload, false).await)
    }

    pub(crate) async fn fetch_my_member(&self, api: &ApiClient) -> Result<Member, ClientError> {
        let path = format!("conversations/{}/members/me", self.id);
        let payload: MemberPayload = api
            .request_as(Method::GET, &path, None, ApiVersion::V03)
            .await?;
        Ok(self.adopt_member(&payload, true).await)
    }

    /// Paginated event history; fetched items are merged into the timeline.
    pub async fn get_events(
        self: &Arc<Self>,
        api: &Arc<ApiClient>,
        request: PageRequest,
    ) -> Result<Page<EventEnvelope>, ClientError> {
        let fetcher = Arc::new(ConversationEventsFetcher {
            api: Arc::clone(api),
            conversation: Arc::clone(self),
        });
        fetcher.fetch_page(request).await
    }

    /// Paginated member listing; fetched items are merged into the member map.
    pub async fn get_members(
        self: &Arc<Self>,
        api: &Arc<ApiClient>,
        request: PageRequest,
    ) -> Result<Page<MemberPayload>, ClientError> {
        let fetcher = Arc::new(ConversationMembersFetcher {
            api: Arc::clone(api),
            conversation: Arc::clone(self),
        });
        fetcher.fetch_page(request).await
    }
}

fn ephemeral_event(
    envelope: &EventEnvelope,
    kind: EventKind,
    body: EventBody,
) -> ConversationEvent {
    ConversationEvent {
        sequence: envelope.id,
        kind,
        from: envelope.from.clone(),
        timestamp: envelope.timestamp,
        body,
        state: AckState::default(),
    }
}

fn upsert_member(
    state: &mut ConversationState,
    conversation_id: &ConversationId,
    member_id: MemberId,
    lifecycle: &MemberLifecycleBody,
    next: MemberState,
    timestamp: Option<DateTime<Utc>>,
) {
    let member = state
        .members
        .entry(member_id.clone())
        .or_insert_with(|| Member {
            id: member_id,
            user_id: lifecycle.user.id.clone(),
            name: lifecycle.user.name.clone(),
            state: next,
            invited_by: lifecycle.invited_by.clone(),
            conversation_id: conversation_id.clone(),
            updated_at: timestamp,
        });
    member.state = next;
    member.user_id = lifecycle.user.id.clone();
    if member.name.is_none() {
        member.name = lifecycle.user.name.clone();
    }
    if let Some(inviter) = &lifecycle.invited_by {
        member.invited_by = Some(inviter.clone());
    }
    if timestamp.is_some() {
        member.updated_at = timestamp;
    }
}

struct ConversationEventsFetcher {
    api: Arc<ApiClient>,
    conversation: Arc<Conversation>,
}

#[async_trait]
impl PageFetcher<EventEnvelope> for ConversationEventsFetcher {
    async fn fetch_page(
        self: Arc<Self>,
        request: PageRequest,
    ) -> Result<Page<EventEnvelope>, ClientError> {
        let path = format!("conversations/{}/events", self.conversation.id);
        let response: PageResponse<EventEnvelope> = self
            .api
            .fetch_page(&path, ApiVersion::V03, &request)
            .await?;
        for envelope in &response.items {
            if let Err(error) = self.conversation.apply_event(envelope).await {
                warn!(
                    conversation_id = %self.conversation.id,
                    sequence = %envelope.id,
                    %error,
                    "skipping undecodable fetched event"
                );
            }
        }
        Ok(Page::new(response.items, response.cursor, request, self))
    }
}

struct ConversationMembersFetcher {
    api: Arc<ApiClient>,
    conversation: Arc<Conversation>,
}

#[async_trait]
impl PageFetcher<MemberPayload> for ConversationMembersFetcher {
    async fn fetch_page(
        self: Arc<Self>,
        request: PageRequest,
    ) -> Result<Page<MemberPayload>, ClientError> {
        let path = format!("conversations/{}/members", self.conversation.id);
        let response: PageResponse<MemberPayload> = self
            .api
            .fetch_page(&path, ApiVersion::V03, &request)
            .await?;
        for payload in &response.items {
            self.conversation.adopt_member(payload, false).await;
        }
        Ok(Page::new(response.items, response.cursor, request, self))
    }
}
