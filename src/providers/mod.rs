//! Generative-AI provider clients
//!
//! Provides:
//! - Provider traits for image generation, chat completion and face swap
//! - An OpenAI-compatible client (synchronous images, chat)
//! - A Novita client (async task API, merge-face)
//! - A process-wide HTTP client, built once on first use

mod novita;
mod openai;
mod throttle;

pub use novita::NovitaClient;
pub use openai::OpenAiCompatClient;
pub use throttle::CallThrottle;

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::credentials::ApiKey;

/// Provider call errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("API error: status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("operation not supported by {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    /// Whether retrying the same call may succeed
    ///
    /// Network failures, throttling and 5xx answers are transient. Other
    /// HTTP statuses and unparseable bodies will not change on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::RateLimited => true,
            ProviderError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            ProviderError::Api(_) | ProviderError::Malformed(_) | ProviderError::Unsupported(_) => {
                false
            }
        }
    }
}

/// An image, either hosted somewhere or held in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Url(String),
    Bytes { data: Vec<u8>, mime_type: String },
}

impl ImageRef {
    /// Parse a `data:` URL or treat the input as a plain URL
    pub fn from_input(input: &str) -> Option<ImageRef> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if let Some(rest) = input.strip_prefix("data:") {
            let (meta, payload) = rest.split_once(',')?;
            let mime_type = meta.strip_suffix(";base64")?;
            let data = BASE64.decode(payload).ok()?;
            return Some(ImageRef::Bytes {
                data,
                mime_type: mime_type.to_string(),
            });
        }
        if input.starts_with("http://") || input.starts_with("https://") {
            return Some(ImageRef::Url(input.to_string()));
        }
        None
    }

    /// Render as a URL a browser can display
    pub fn to_url(&self) -> String {
        match self {
            ImageRef::Url(url) => url.clone(),
            ImageRef::Bytes { data, mime_type } => {
                format!("data:{};base64,{}", mime_type, BASE64.encode(data))
            }
        }
    }

    /// Fetch (if needed) and base64-encode the image bytes
    pub async fn to_base64(&self, client: &Client) -> Result<String, ProviderError> {
        match self {
            ImageRef::Bytes { data, .. } => Ok(BASE64.encode(data)),
            ImageRef::Url(url) => {
                let response = client.get(url).send().await?;
                if !response.status().is_success() {
                    return Err(ProviderError::Api(format!(
                        "fetching {} returned {}",
                        url,
                        response.status()
                    )));
                }
                Ok(BASE64.encode(response.bytes().await?))
            }
        }
    }
}

/// One image-generation job as sent to a provider
#[derive(Debug, Clone)]
pub struct ImageJob {
    /// Upstream model identifier
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub seed: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    /// Source image for image-to-image
    pub init_image: Option<ImageRef>,
    /// How far image-to-image may move from the source (0..1)
    pub strength: f32,
}

/// Outcome of submitting a job
#[derive(Debug, Clone)]
pub enum Submission {
    /// Provider answered synchronously
    Ready(ImageRef),
    /// Provider queued the job; poll with this task handle
    Pending(String),
}

/// Provider-side task state
#[derive(Debug, Clone)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded(ImageRef),
    Failed(String),
}

/// Text-to-image / image-to-image provider
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit(&self, key: &ApiKey, job: &ImageJob) -> Result<Submission, ProviderError>;

    async fn poll(&self, key: &ApiKey, task_id: &str) -> Result<TaskStatus, ProviderError>;
}

/// Chat message for LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

/// Chat-completion provider
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(
        &self,
        key: &ApiKey,
        account_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, ProviderError>;
}

/// Identity-preserving face replacement
#[async_trait]
pub trait FaceSwapProvider: Send + Sync {
    async fn swap_face(
        &self,
        key: &ApiKey,
        face: &ImageRef,
        target: &ImageRef,
    ) -> Result<ImageRef, ProviderError>;
}

static HTTP_CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared HTTP client; the first caller's timeout wins
pub async fn shared_client(timeout: Duration) -> Result<Client, ProviderError> {
    let client = HTTP_CLIENT
        .get_or_try_init(|| async {
            Client::builder()
                .timeout(timeout)
                .user_agent(concat!("portraitd/", env!("CARGO_PKG_VERSION")))
                .build()
        })
        .await?;
    Ok(client.clone())
}

/// Read a non-2xx response into an API error
async fn api_error(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::warn!("Provider API error: {} - {}", status, body);
    ProviderError::Status(status)
}
