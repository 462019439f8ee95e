use std::sync::atomic::{AtomicBool, Ordering};

use shared::domain::SessionId;
use tokio::sync::RwLock;

use crate::pagination::PageRequest;

/// Construction-time configuration for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    /// Realtime endpoint; derived from `api_url` when unset.
    pub ws_url: Option<String>,
    pub token: String,
    /// Route inbound events through the ordering queue instead of
    /// processing them inline.
    pub buffer_events: bool,
    /// Backfill a conversation's event timeline after every fetch.
    pub full_sync: bool,
    pub page_defaults: PageRequest,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        let api_url = api_url.into();
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            ws_url: None,
            token: token.into(),
            buffer_events: true,
            full_sync: false,
            page_defaults: PageRequest::default(),
        }
    }
}

/// Process-wide authentication/config context. Mutated only by token
/// refresh and reconnect handling.
pub struct Session {
    api_url: String,
    ws_url: Option<String>,
    pub buffer_events: bool,
    pub full_sync: bool,
    page_defaults: PageRequest,
    token: RwLock<String>,
    session_id: RwLock<Option<SessionId>>,
    connected: AtomicBool,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            api_url: config.api_url,
            ws_url: config.ws_url,
            buffer_events: config.buffer_events,
            full_sync: config.full_sync,
            page_defaults: config.page_defaults,
            token: RwLock::new(config.token),
            session_id: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref()
    }

    pub fn page_defaults(&self) -> PageRequest {
        self.page_defaults.clone()
    }

    pub async fn token(&self) -> String {
        self.token.read().await.clone()
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = token.into();
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().await.clone()
    }

    pub async fn set_session_id(&self, session_id: SessionId) {
        *self.session_id.write().await = Some(session_id);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}
