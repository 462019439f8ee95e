use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    ConversationId, EventSequence, KnockingId, MemberId, MemberState, RtcId, SessionId, UserId,
};

/// Classified realtime event type tag.
///
/// The wire carries a flat string tag (`"text"`, `"member:invited"`,
/// `"sip:answered"`, ...); classification is a total function so unknown
/// tags degrade to [`EventKind::Generic`] instead of failing the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Text,
    Image,
    Message,
    MemberInvited,
    MemberJoined,
    MemberLeft,
    Receipt(ReceiptStatus),
    EventDeleted,
    Sip(SipSignal),
    Rtc(RtcSignal),
    Generic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiptStatus {
    Seen,
    Delivered,
    Submitted,
    Rejected,
    Undeliverable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipSignal {
    Ringing,
    Answered,
    Hangup,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtcSignal {
    Offer,
    Answer,
    Transfer,
    Hangup,
    Terminate,
    Status,
}

impl EventKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "text" => return EventKind::Text,
            "image" => return EventKind::Image,
            "message" => return EventKind::Message,
            "member:invited" => return EventKind::MemberInvited,
            "member:joined" => return EventKind::MemberJoined,
            "member:left" => return EventKind::MemberLeft,
            "event:delete" => return EventKind::EventDeleted,
            _ => {}
        }
        if let Some(signal) = tag.strip_prefix("sip:") {
            return match signal {
                "ringing" => EventKind::Sip(SipSignal::Ringing),
                "answered" => EventKind::Sip(SipSignal::Answered),
                "hangup" => EventKind::Sip(SipSignal::Hangup),
                _ => EventKind::Sip(SipSignal::Status),
            };
        }
        if let Some(signal) = tag.strip_prefix("rtc:") {
            return match signal {
                "offer" => EventKind::Rtc(RtcSignal::Offer),
                "answer" => EventKind::Rtc(RtcSignal::Answer),
                "transfer" => EventKind::Rtc(RtcSignal::Transfer),
                "hangup" => EventKind::Rtc(RtcSignal::Hangup),
                "terminate" => EventKind::Rtc(RtcSignal::Terminate),
                _ => EventKind::Rtc(RtcSignal::Status),
            };
        }
        if let Some((family, status)) = tag.split_once(':') {
            if matches!(family, "text" | "image" | "message") {
                let status = match status {
                    "seen" => Some(ReceiptStatus::Seen),
                    "delivered" => Some(ReceiptStatus::Delivered),
                    "submitted" => Some(ReceiptStatus::Submitted),
                    "rejected" => Some(ReceiptStatus::Rejected),
                    "undeliverable" => Some(ReceiptStatus::Undeliverable),
                    _ => None,
                };
                if let Some(status) = status {
                    return EventKind::Receipt(status);
                }
            }
        }
        EventKind::Generic(tag.to_string())
    }

    pub fn is_sip(&self) -> bool {
        matches!(self, EventKind::Sip(_))
    }

    pub fn is_rtc(&self) -> bool {
        matches!(self, EventKind::Rtc(_))
    }

    pub fn is_member_lifecycle(&self) -> bool {
        matches!(
            self,
            EventKind::MemberInvited | EventKind::MemberJoined | EventKind::MemberLeft
        )
    }
}

/// Lightweight reference to a user as it appears embedded in events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(alias = "user_id")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddedInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user: Option<UserRef>,
}

/// One inbound realtime event as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventSequence,
    #[serde(rename = "type")]
    pub kind_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<MemberId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: Value,
    #[serde(default, rename = "_embedded", skip_serializing_if = "Option::is_none")]
    pub embedded: Option<EmbeddedInfo>,
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.kind_tag)
    }

    /// The user this event acts on or originates from, resolved the way the
    /// service embeds it: `_embedded.from_user` wins over `body.user`.
    pub fn acting_user_id(&self) -> Option<UserId> {
        if let Some(user) = self.embedded.as_ref().and_then(|e| e.from_user.as_ref()) {
            return Some(user.id.clone());
        }
        let user = self.body.get("user")?;
        serde_json::from_value::<UserRef>(user.clone())
            .ok()
            .map(|u| u.id)
    }

    /// Whether this event belongs to the call-signaling path, where the
    /// narrower conversation fetch applies.
    pub fn is_call_path(&self) -> bool {
        let kind = self.kind();
        if kind.is_sip() || kind.is_rtc() {
            return true;
        }
        kind == EventKind::MemberInvited
            && (self.body.get("media").is_some() || self.body.get("knocking_id").is_some())
    }
}

/// Typed payload union, decoded from an envelope's tag + raw body.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    Text(TextBody),
    Image(ImageBody),
    Message(MessageBody),
    MemberInvited(MemberLifecycleBody),
    MemberJoined(MemberLifecycleBody),
    MemberLeft(MemberLifecycleBody),
    Receipt(ReceiptBody),
    EventDeleted(EventRefBody),
    Signal(SignalBody),
    /// Tombstone left in the timeline after an `event:delete`.
    Deleted,
    Generic {
        kind: String,
        body: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBody {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberLifecycleBody {
    pub user: UserRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invited_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knocking_id: Option<KnockingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptBody {
    pub event_id: EventSequence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRefBody {
    pub event_id: EventSequence,
}

/// Opaque signaling payload; the SIP/RTC internals live behind the
/// signaling collaborator, only the leg reference is interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtc_id: Option<RtcId>,
    #[serde(flatten)]
    pub rest: Value,
}

impl EventBody {
    /// Dispatch table keyed by the classified tag. Known kinds deserialize
    /// strictly; a malformed body for a known kind is a decode error, an
    /// unknown tag falls through to `Generic`.
    pub fn decode(kind: &EventKind, body: &Value) -> Result<EventBody, serde_json::Error> {
        let decoded = match kind {
            EventKind::Text => EventBody::Text(serde_json::from_value(body.clone())?),
            EventKind::Image => EventBody::Image(serde_json::from_value(body.clone())?),
            EventKind::Message => EventBody::Message(serde_json::from_value(body.clone())?),
            EventKind::MemberInvited => {
                EventBody::MemberInvited(serde_json::from_value(body.clone())?)
            }
            EventKind::MemberJoined => {
                EventBody::MemberJoined(serde_json::from_value(body.clone())?)
            }
            EventKind::MemberLeft => EventBody::MemberLeft(serde_json::from_value(body.clone())?),
            EventKind::Receipt(_) => EventBody::Receipt(serde_json::from_value(body.clone())?),
            EventKind::EventDeleted => {
                EventBody::EventDeleted(serde_json::from_value(body.clone())?)
            }
            EventKind::Sip(_) | EventKind::Rtc(_) => {
                EventBody::Signal(serde_json::from_value(body.clone())?)
            }
            EventKind::Generic(tag) => EventBody::Generic {
                kind: tag.clone(),
                body: body.clone(),
            },
        };
        Ok(decoded)
    }
}

/// Validation shared by decode sites: member lifecycle events must carry the
/// affected member id in the envelope `from` field.
pub fn require_member_id(envelope: &EventEnvelope) -> Result<MemberId, serde_json::Error> {
    envelope
        .from
        .clone()
        .ok_or_else(|| serde_json::Error::custom("member lifecycle event missing member id"))
}

/// Uniform cursor pair returned by every paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Uniform paginated response shape: `{ items: [...], cursor: { prev?, next? } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub cursor: CursorPair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    #[serde(alias = "uuid")]
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub members: Vec<MemberPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPayload {
    pub id: MemberId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: MemberState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invited_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSessionPayload {
    pub session_id: SessionId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversationRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallTargetKind {
    App,
    Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCallRequest {
    pub to: Vec<String>,
    pub target_kind: CallTargetKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub custom_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCallResponse {
    pub knocking_id: KnockingId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUpdateRequest {
    pub token: String,
}
