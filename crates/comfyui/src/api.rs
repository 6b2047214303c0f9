//! REST side-channel for queueing workflows on ComfyUI.
//!
//! A prompt is queued with `POST /prompt`; the returned `prompt_id`
//! correlates the WebSocket events that follow. [`Enqueue`] abstracts
//! the call so the session can be exercised without a server.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// Default upper bound on one `POST /prompt` round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Queues a resolved workflow graph for execution.
#[async_trait]
pub trait Enqueue: Send + Sync + 'static {
    /// Queue `graph` on behalf of `client_id`, returning the prompt id.
    async fn enqueue(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError>;
}

/// Queues prompts on one ComfyUI server over `POST /prompt`.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body of a successful `/prompt` response.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Queue position assigned by the server.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Failures to queue a prompt.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport-level failure before any status was received.
    #[error("Prompt request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx status, typically a graph that failed validation.
    #[error("ComfyUI rejected the prompt with status {status}: {body}")]
    ApiError {
        status: u16,
        /// Response text, usually ComfyUI's `node_errors` report.
        body: String,
    },

    /// A 2xx response without a `prompt_id`.
    #[error("ComfyUI accepted the prompt but returned no prompt_id")]
    MissingPromptId,
}

impl ComfyUIApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    /// * `request_timeout` - Bound on each request, connect included.
    pub fn new(
        api_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution via `POST /prompt`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.json::<SubmitResponse>().await?)
    }

    /// Map a non-2xx response to [`ComfyUIApiError::ApiError`].
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_default();
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Enqueue for ComfyUIApi {
    async fn enqueue(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError> {
        let response = self.submit_workflow(graph, client_id).await?;
        let prompt_id = response.prompt_id.ok_or(ComfyUIApiError::MissingPromptId)?;
        tracing::debug!(prompt_id = %prompt_id, queue_number = ?response.number, "Prompt queued");
        Ok(prompt_id)
    }
}
