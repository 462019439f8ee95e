use shared::{domain::ConversationId, error::ApiError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Prev,
    Next,
}

impl std::fmt::Display for PageDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageDirection::Prev => f.write_str("previous"),
            PageDirection::Next => f.write_str("next"),
        }
    }
}

/// One failed HTTP round trip against the conversation service.
#[derive(Debug, Error)]
pub enum ApiFailure {
    #[error("request transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("service rejected request ({status}): {error}")]
    Service { status: u16, error: ApiError },
}

/// Error taxonomy of the sync core. Parameter validation is never retried;
/// api failures wrap the round trip; reconciliation failures drop the event
/// after surfacing.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Api(#[from] ApiFailure),
    #[error("failed to decode {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no {0} page available")]
    NoSuchPage(PageDirection),
    #[error("reconciliation failed for conversation {conversation_id}: {source}")]
    Reconciliation {
        conversation_id: ConversationId,
        #[source]
        source: Box<ClientError>,
    },
    #[error("realtime transport failure: {0}")]
    Transport(String),
    #[error("no active session: {0}")]
    NoSession(&'static str),
}

impl ClientError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        ClientError::InvalidParams(message.into())
    }

    pub fn decode(context: impl Into<String>, source: serde_json::Error) -> Self {
        ClientError::Decode {
            context: context.into(),
            source,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ClientError::InvalidParams(_))
    }
}
