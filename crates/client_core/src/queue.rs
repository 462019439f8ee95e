use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use shared::{domain::ConversationId, protocol::EventEnvelope};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::ClientError;
use crate::ClientNotification;

/// Ordering scope of a queued event. Events for the same conversation are
/// serialized; events without a conversation share one global lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueScope {
    Global,
    Conversation(ConversationId),
}

impl QueueScope {
    pub fn for_event(envelope: &EventEnvelope) -> Self {
        match &envelope.cid {
            Some(cid) => QueueScope::Conversation(cid.clone()),
            None => QueueScope::Global,
        }
    }
}

#[async_trait]
pub trait OrderedEventHandler: Send + Sync {
    async fn process(&self, envelope: EventEnvelope) -> Result<(), ClientError>;
}

/// Per-scope FIFO buffer. Items enqueued for one scope are handed to the
/// handler strictly one at a time in enqueue order; the lane does not
/// advance until the handler's outcome is observed, even across
/// asynchronous cache repairs. Lanes for different scopes run
/// concurrently. A handler failure is surfaced on the notification
/// channel and the lane proceeds to the next item.
pub struct EventOrderingQueue {
    handler: Arc<dyn OrderedEventHandler>,
    notifications: broadcast::Sender<ClientNotification>,
    lanes: Mutex<HashMap<QueueScope, mpsc::UnboundedSender<EventEnvelope>>>,
}

impl EventOrderingQueue {
    pub fn new(
        handler: Arc<dyn OrderedEventHandler>,
        notifications: broadcast::Sender<ClientNotification>,
    ) -> Self {
        Self {
            handler,
            notifications,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, envelope: EventEnvelope) {
        let scope = QueueScope::for_event(&envelope);
        let mut lanes = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let lane = lanes
            .entry(scope.clone())
            .or_insert_with(|| self.spawn_lane(scope.clone()));
        if let Err(returned) = lane.send(envelope) {
            // lane worker ended; replace it and redeliver
            let lane = self.spawn_lane(scope.clone());
            let _ = lane.send(returned.0);
            lanes.insert(scope, lane);
        }
    }

    fn spawn_lane(&self, scope: QueueScope) -> mpsc::UnboundedSender<EventEnvelope> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();
        let handler = Arc::clone(&self.handler);
        let notifications = self.notifications.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(error) = handler.process(envelope).await {
                    warn!(?scope, %error, "queued event processing failed");
                    let _ = notifications.send(ClientNotification::Error(error.to_string()));
                }
            }
        });
        tx
    }
}
