use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use shared::domain::{CallDirection, CallStatus, ConversationId, KnockingId, RtcId};
use shared::protocol::{CallTargetKind, StartCallRequest, StartCallResponse};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::cache::{ConversationCache, Fidelity};
use crate::conversation::Conversation;
use crate::error::ClientError;
use crate::http::{ApiClient, ApiVersion};
use crate::ClientNotification;

/// One voice/video call, layered on a conversation's membership and
/// signaling timeline. Leg references are opaque to the core.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub knocking_id: Option<KnockingId>,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub conversation: Option<Arc<Conversation>>,
    pub rtc_objects: HashMap<RtcId, Value>,
}

/// Builds and tracks call sessions. Draft ("knocking") sessions are keyed
/// by knocking id until their conversation is known, then promoted into
/// the active map keyed by conversation id.
pub struct CallController {
    api: Arc<ApiClient>,
    cache: Arc<ConversationCache>,
    notifications: broadcast::Sender<ClientNotification>,
    drafts: Mutex<HashMap<KnockingId, CallSession>>,
    active: Mutex<HashMap<ConversationId, CallSession>>,
}

impl CallController {
    pub fn new(
        api: Arc<ApiClient>,
        cache: Arc<ConversationCache>,
        notifications: broadcast::Sender<ClientNotification>,
    ) -> Self {
        Self {
            api,
            cache,
            notifications,
            drafts: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start an outbound call to one or more named users.
    pub async fn in_app_call(&self, usernames: &[String]) -> Result<CallSession, ClientError> {
        if usernames.is_empty() || usernames.iter().all(|name| name.trim().is_empty()) {
            return Err(ClientError::invalid_params(
                "call requires at least one target user",
            ));
        }
        self.start_call(usernames.to_vec(), CallTargetKind::App, Value::Null)
            .await
    }

    /// Start an outbound call to a phone endpoint.
    pub async fn call_phone(
        &self,
        number: &str,
        custom_data: Value,
    ) -> Result<CallSession, ClientError> {
        if number.trim().is_empty() {
            return Err(ClientError::invalid_params("call requires a phone number"));
        }
        self.start_call(vec![number.to_string()], CallTargetKind::Phone, custom_data)
            .await
    }

    async fn start_call(
        &self,
        to: Vec<String>,
        target_kind: CallTargetKind,
        custom_data: Value,
    ) -> Result<CallSession, ClientError> {
        let request = StartCallRequest {
            to,
            target_kind,
            custom_data,
        };
        let body = serde_json::to_value(&request)
            .map_err(|source| ClientError::decode("call request", source))?;
        let response: StartCallResponse = self
            .api
            .request_as(Method::POST, "knocking", Some(body), ApiVersion::V01)
            .await?;

        let mut session = CallSession {
            knocking_id: Some(response.knocking_id.clone()),
            direction: CallDirection::Outbound,
            status: CallStatus::Started,
            conversation: None,
            rtc_objects: HashMap::new(),
        };
        match &response.conversation_id {
            Some(conversation_id) => {
                let conversation = self.cache.get_or_create(conversation_id).await;
                session.conversation = Some(conversation);
                self.active
                    .lock()
                    .await
                    .insert(conversation_id.clone(), session.clone());
            }
            None => {
                self.drafts
                    .lock()
                    .await
                    .insert(response.knocking_id.clone(), session.clone());
            }
        }
        info!(
            knocking_id = %response.knocking_id,
            target_kind = ?target_kind,
            "call started"
        );
        let _ = self.notifications.send(ClientNotification::CallStatusChanged {
            call: session.clone(),
        });
        Ok(session)
    }

    /// Reconnect a leg to an ongoing call. The initial status is derived by
    /// inspecting the conversation's accumulated signaling events.
    pub async fn reconnect_call(
        &self,
        conversation_id: &ConversationId,
        rtc_id: &RtcId,
    ) -> Result<CallSession, ClientError> {
        if conversation_id.as_str().is_empty() || rtc_id.as_str().is_empty() {
            return Err(ClientError::invalid_params(
                "reconnect requires a conversation id and an rtc id",
            ));
        }
        let conversation = self.cache.fetch(conversation_id, Fidelity::Summary).await?;
        let status = conversation.derive_call_status().await;

        let mut rtc_objects = HashMap::new();
        rtc_objects.insert(rtc_id.clone(), Value::Null);
        let session = CallSession {
            knocking_id: None,
            direction: CallDirection::Inbound,
            status,
            conversation: Some(Arc::clone(&conversation)),
            rtc_objects,
        };
        self.active
            .lock()
            .await
            .insert(conversation_id.clone(), session.clone());
        let _ = self.notifications.send(ClientNotification::CallStatusChanged {
            call: session.clone(),
        });
        Ok(session)
    }

    /// Promote a draft once its conversation is known.
    pub async fn promote_draft(
        &self,
        knocking_id: &KnockingId,
        conversation: Arc<Conversation>,
    ) -> Option<CallSession> {
        let mut session = self.drafts.lock().await.remove(knocking_id)?;
        session.conversation = Some(Arc::clone(&conversation));
        self.active
            .lock()
            .await
            .insert(conversation.id.clone(), session.clone());
        Some(session)
    }

    /// Drop a draft that was rejected before its conversation was known.
    pub async fn discard_draft(&self, knocking_id: &KnockingId) -> Option<CallSession> {
        self.drafts.lock().await.remove(knocking_id)
    }

    /// Advance an active call through the status machine. Terminal states
    /// remove the session from the active map.
    pub async fn transition(
        &self,
        conversation_id: &ConversationId,
        next: CallStatus,
    ) -> Result<CallSession, ClientError> {
        let session = {
            let mut active = self.active.lock().await;
            let session = active.get_mut(conversation_id).ok_or_else(|| {
                ClientError::invalid_params(format!(
                    "no active call for conversation {conversation_id}"
                ))
            })?;
            if !session.status.can_transition_to(next) {
                return Err(ClientError::invalid_params(format!(
                    "call cannot move from {} to {}",
                    session.status, next
                )));
            }
            session.status = next;
            let session = session.clone();
            if next.is_terminal() {
                active.remove(conversation_id);
            }
            session
        };
        let _ = self.notifications.send(ClientNotification::CallStatusChanged {
            call: session.clone(),
        });
        Ok(session)
    }

    pub async fn active_call(&self, conversation_id: &ConversationId) -> Option<CallSession> {
        self.active.lock().await.get(conversation_id).cloned()
    }

    pub async fn draft(&self, knocking_id: &KnockingId) -> Option<CallSession> {
        self.drafts.lock().await.get(knocking_id).cloned()
    }
}
