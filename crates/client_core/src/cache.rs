use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use shared::domain::ConversationId;
use shared::protocol::{ConversationPayload, PageResponse};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::conversation::Conversation;
use crate::error::ClientError;
use crate::http::{ApiClient, ApiVersion};
use crate::pagination::{Page, PageFetcher, PageRequest};
use crate::session::Session;

/// Fidelity of a conversation fetch. `Full` is the default and includes
/// the member list; `Summary` is the narrower shape used on the
/// call-signaling path where latency matters more than membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fidelity {
    Summary,
    Full,
}

impl Fidelity {
    fn api_version(self) -> ApiVersion {
        match self {
            Fidelity::Summary => ApiVersion::V01,
            Fidelity::Full => ApiVersion::V03,
        }
    }
}

/// Authoritative local map of conversation id to conversation state.
/// Every code path that learns of a conversation id goes through
/// [`ConversationCache::get_or_create`], so an id never maps to two
/// instances.
pub struct ConversationCache {
    api: Arc<ApiClient>,
    session: Arc<Session>,
    conversations: Mutex<HashMap<ConversationId, Arc<Conversation>>>,
}

impl ConversationCache {
    pub fn new(api: Arc<ApiClient>, session: Arc<Session>) -> Self {
        Self {
            api,
            session,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.conversations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.lock().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<ConversationId> {
        self.conversations.lock().await.keys().cloned().collect()
    }

    /// The single entry point creating conversation handles.
    pub async fn get_or_create(&self, id: &ConversationId) -> Arc<Conversation> {
        let mut conversations = self.conversations.lock().await;
        conversations
            .entry(id.clone())
            .or_insert_with(|| Conversation::new(id.clone()))
            .clone()
    }

    /// Drop a stale entry so the next fetch rebuilds it.
    pub async fn evict(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.lock().await.remove(id)
    }

    /// Fetch the canonical representation at the requested fidelity and
    /// merge it into the cached entry. Only the full-fidelity fetch, and
    /// only while "my membership" is unknown, resolves the current user's
    /// own member; failing that twice degrades with a warning instead of
    /// failing the fetch.
    pub async fn fetch(
        &self,
        id: &ConversationId,
        fidelity: Fidelity,
    ) -> Result<Arc<Conversation>, ClientError> {
        let path = format!("conversations/{id}");
        let payload: ConversationPayload = self
            .api
            .request_as(Method::GET, &path, None, fidelity.api_version())
            .await?;

        let conversation = self.get_or_create(&payload.id).await;
        conversation.merge_payload(&payload).await;

        if fidelity == Fidelity::Full && conversation.my_member().await.is_none() {
            self.resolve_my_membership(&conversation).await;
        }

        if self.session.full_sync {
            conversation
                .get_events(&self.api, self.session.page_defaults())
                .await?;
        }

        Ok(conversation)
    }

    async fn resolve_my_membership(&self, conversation: &Arc<Conversation>) {
        // One fetch plus one retry, then degrade: the conversation stays
        // usable without "my membership" populated.
        const ATTEMPTS: usize = 2;
        for attempt in 1..=ATTEMPTS {
            match conversation.fetch_my_member(&self.api).await {
                Ok(member) => {
                    conversation.set_my_member(member).await;
                    return;
                }
                Err(error) if attempt < ATTEMPTS => {
                    debug!(
                        conversation_id = %conversation.id,
                        %error,
                        "membership lookup failed, retrying"
                    );
                }
                Err(error) => {
                    warn!(
                        conversation_id = %conversation.id,
                        %error,
                        "no membership resolved for conversation"
                    );
                }
            }
        }
    }
}

/// Root-level conversations listing; fetched summaries are merged through
/// the cache's single get-or-create entry point.
pub(crate) struct ConversationListFetcher {
    pub(crate) api: Arc<ApiClient>,
    pub(crate) cache: Arc<ConversationCache>,
    pub(crate) path: String,
}

#[async_trait]
impl PageFetcher<ConversationPayload> for ConversationListFetcher {
    async fn fetch_page(
        self: Arc<Self>,
        request: PageRequest,
    ) -> Result<Page<ConversationPayload>, ClientError> {
        let response: PageResponse<ConversationPayload> = self
            .api
            .fetch_page(&self.path, ApiVersion::V03, &request)
            .await?;
        for payload in &response.items {
            let conversation = self.cache.get_or_create(&payload.id).await;
            conversation.merge_payload(payload).await;
        }
        Ok(Page::new(response.items, response.cursor, request, self))
    }
}
