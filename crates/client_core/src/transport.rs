use std::sync::Arc;

use futures::StreamExt;
use shared::protocol::EventEnvelope;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;

use crate::error::ClientError;
use crate::{ClientNotification, ConversationClient};

/// Rewrite an http(s) service url into its websocket counterpart.
pub(crate) fn websocket_url(server_url: &str) -> Result<String, ClientError> {
    if let Some(rest) = server_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        Ok(server_url.to_string())
    } else {
        Err(ClientError::Transport(
            "server url must start with http:// or https://".to_string(),
        ))
    }
}

impl ConversationClient {
    /// Connect the realtime stream and pump inbound events into the
    /// dispatcher in transport delivery order. The socket internals stay
    /// behind this boundary; the dispatcher only ever sees decoded
    /// envelopes.
    pub async fn connect_realtime(self: &Arc<Self>) -> Result<(), ClientError> {
        let base = match self.session().ws_url() {
            Some(url) => url.to_string(),
            None => self.session().api_url().to_string(),
        };
        let endpoint = format!(
            "{}/realtime?token={}",
            websocket_url(&base)?,
            self.session().token().await
        );
        let (stream, _) = connect_async(&endpoint)
            .await
            .map_err(|error| ClientError::Transport(format!("websocket connect failed: {error}")))?;
        let (_, mut reader) = stream.split();
        self.session().set_connected(true);
        info!("realtime stream connected");

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<EventEnvelope>(&text) {
                            Ok(envelope) => {
                                if let Err(error) = client.handle_event(envelope).await {
                                    let _ = client.notifications().send(
                                        ClientNotification::Error(error.to_string()),
                                    );
                                }
                            }
                            Err(error) => {
                                let _ = client.notifications().send(ClientNotification::Error(
                                    format!("invalid realtime event: {error}"),
                                ));
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        let _ = client.notifications().send(ClientNotification::Error(
                            format!("websocket receive failed: {error}"),
                        ));
                        break;
                    }
                }
            }
            client.session().set_connected(false);
            info!("realtime stream disconnected");
        });

        Ok(())
    }
}
