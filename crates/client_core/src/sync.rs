use std::sync::Arc;
use std::time::Instant;

use shared::domain::ConversationId;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::{ConversationCache, Fidelity};
use crate::error::ClientError;
use crate::ClientNotification;

/// Sequential bulk loader: walks a known conversation set, fetching each
/// one at full fidelity to populate the cache, emitting progress after
/// every fetch. Sequential by design, trading throughput for bounded load
/// on the service and deterministic progress reporting.
pub struct SyncProgressTracker {
    cache: Arc<ConversationCache>,
    notifications: broadcast::Sender<ClientNotification>,
}

impl SyncProgressTracker {
    pub fn new(
        cache: Arc<ConversationCache>,
        notifications: broadcast::Sender<ClientNotification>,
    ) -> Self {
        Self {
            cache,
            notifications,
        }
    }

    pub async fn run(&self, conversations: &[ConversationId]) -> Result<(), ClientError> {
        let total = conversations.len();
        if total == 0 {
            debug!("no conversations to sync");
            return Ok(());
        }
        let started = Instant::now();
        for (index, id) in conversations.iter().enumerate() {
            self.cache.fetch(id, Fidelity::Full).await?;
            let synced = index + 1;
            let percent = (synced as f64 / total as f64 * 100.0 * 100.0).round() / 100.0;
            info!(synced, total, percent, "conversation sync progress");
            let _ = self
                .notifications
                .send(ClientNotification::SyncProgress { percent });
        }
        info!(
            total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "conversation sync complete"
        );
        Ok(())
    }
}
