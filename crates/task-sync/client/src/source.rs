//! Persisted conversation fetching.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use task_sync::PersistedMessage;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{ClientError, Result};

/// Where finalized conversation records come from.
#[async_trait]
pub trait ConversationSource: Send + Sync + 'static {
    async fn fetch_persisted_conversation(&self, task_id: &str) -> Result<Vec<PersistedMessage>>;

    /// Drop any cached copy so the next fetch returns fresh records.
    fn invalidate(&self, _task_id: &str) {}
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConversationResponse {
    Messages(Vec<PersistedMessage>),
    Wrapped { messages: Vec<PersistedMessage> },
}

impl ConversationResponse {
    fn into_messages(self) -> Vec<PersistedMessage> {
        match self {
            Self::Messages(messages) | Self::Wrapped { messages } => messages,
        }
    }
}

/// Task service HTTP client for conversation records.
#[derive(Debug, Clone)]
pub struct HttpConversationSource {
    base_url: Url,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

impl HttpConversationSource {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.api_base()?,
            timeout: config.request_timeout.max(Duration::from_millis(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    /// `{api_base}/api/v1/tasks/{task_id}/conversation`, with the task id
    /// percent-encoded as one path segment.
    pub fn conversation_url(&self, task_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ClientError::InvalidUrl(format!("API base cannot take a path: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(["api", "v1", "tasks", task_id.trim(), "conversation"]);
        Ok(url)
    }

    async fn send_get(&self, url: Url) -> Result<reqwest::Response> {
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let request = self
                .http
                .get(url.clone())
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    debug!(attempt, "conversation request to {} failed: {}", url, error);
                    last_error = Some(error.to_string());
                }
            }
        }

        Err(ClientError::Request(
            last_error.unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

#[async_trait]
impl ConversationSource for HttpConversationSource {
    async fn fetch_persisted_conversation(&self, task_id: &str) -> Result<Vec<PersistedMessage>> {
        if task_id.trim().is_empty() {
            return Err(ClientError::Request("task id is empty".to_string()));
        }
        let response = self.send_get(self.conversation_url(task_id)?).await?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ClientError::Request(error.to_string()))?;

        if !status.is_success() {
            return Err(format_http_error(status.as_u16(), &bytes));
        }

        serde_json::from_slice::<ConversationResponse>(&bytes)
            .map(ConversationResponse::into_messages)
            .map_err(|error| ClientError::Decode(error.to_string()))
    }
}

pub fn format_http_error(status: u16, body: &[u8]) -> ClientError {
    let body = String::from_utf8_lossy(body).trim().to_string();
    let body = if body.is_empty() {
        "<empty>".to_string()
    } else {
        body
    };
    ClientError::Http { status, body }
}
