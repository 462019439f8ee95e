use std::sync::Arc;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::error::{ApiError, ErrorCode};
use shared::protocol::PageResponse;

use crate::error::{ApiFailure, ClientError};
use crate::pagination::PageRequest;
use crate::session::Session;

/// Service API version tag. The full representation (members included)
/// lives under `v0.3`; `v0.1` serves the narrower summary shape used on
/// the call-signaling path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V01,
    V03,
}

impl ApiVersion {
    pub fn path_segment(&self) -> &'static str {
        match self {
            ApiVersion::V01 => "v0.1",
            ApiVersion::V03 => "v0.3",
        }
    }
}

/// HTTP collaborator: one typed request/response seam over reqwest.
pub struct ApiClient {
    http: Client,
    session: Arc<Session>,
}

impl ApiClient {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            http: Client::new(),
            session,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        version: ApiVersion,
    ) -> Result<Value, ClientError> {
        let url = self.url_for(version, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(self.session.token().await);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(ApiFailure::from)?;
        Self::decode_response(response).await
    }

    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        version: ApiVersion,
    ) -> Result<T, ClientError> {
        let value = self.request(method, path, body, version).await?;
        serde_json::from_value(value).map_err(|source| ClientError::decode(path.to_string(), source))
    }

    /// One paginated fetch with the uniform listing query parameters.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        path: &str,
        version: ApiVersion,
        request: &PageRequest,
    ) -> Result<PageResponse<T>, ClientError> {
        let url = self.url_for(version, path);
        let mut query: Vec<(&str, String)> = vec![
            ("order", request.order.as_str().to_string()),
            ("page_size", request.page_size.to_string()),
        ];
        if let Some(cursor) = &request.cursor {
            query.push(("cursor", cursor.clone()));
        }
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.session.token().await)
            .query(&query)
            .send()
            .await
            .map_err(ApiFailure::from)?;
        let value = Self::decode_response(response).await?;
        serde_json::from_value(value).map_err(|source| ClientError::decode(path.to_string(), source))
    }

    fn url_for(&self, version: ApiVersion, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.session.api_url(),
            version.path_segment(),
            path
        )
    }

    async fn decode_response(response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        if status.is_success() {
            let text = response.text().await.map_err(ApiFailure::from)?;
            if text.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text)
                .map_err(|source| ClientError::decode("response body", source))
        } else {
            let error = match response.json::<ApiError>().await {
                Ok(error) => error,
                Err(_) => ApiError::new(ErrorCode::Internal, format!("http status {status}")),
            };
            Err(ApiFailure::Service {
                status: status.as_u16(),
                error,
            }
            .into())
        }
    }
}
