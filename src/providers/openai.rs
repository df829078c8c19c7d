//! OpenAI-compatible provider (Venice and similar)
//!
//! Provides:
//! - Chat completions (prompt enhancement)
//! - Synchronous text-to-image
//! - Per-account throttling ahead of billed chat calls

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::throttle::CallThrottle;
use super::{
    api_error, ChatMessage, ChatProvider, ImageJob, ImageProvider, ImageRef, ProviderError,
    Submission, TaskStatus,
};
use crate::credentials::ApiKey;

/// Chat completion request
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

/// Chat completion response
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Image generation request
#[derive(Debug, Serialize)]
struct ImageRequest {
    model: String,
    prompt: String,
    negative_prompt: String,
    n: u32,
    size: String,
    seed: u32,
}

/// Image generation response
#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
}

/// OpenAI-compatible API client
#[derive(Debug)]
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    chat_model: String,
    throttle: CallThrottle,
}

impl OpenAiCompatClient {
    /// Create a new client against `base_url` (e.g. `https://api.venice.ai/api/v1`)
    pub fn new(client: Client, base_url: &str, chat_model: &str, throttle: CallThrottle) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_model: chat_model.to_string(),
            throttle,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatClient {
    async fn complete(
        &self,
        key: &ApiKey,
        account_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, ProviderError> {
        if !self.throttle.try_acquire(account_id).await {
            let wait = self.throttle.retry_after(account_id).await;
            debug!("Chat throttled for {} ({:?})", account_id, wait);
            return Err(ProviderError::RateLimited);
        }

        let request = ChatRequest {
            model: self.chat_model.clone(),
            messages,
            max_tokens: 512,
            temperature: 0.7,
        };

        debug!("Sending chat request: {}", request.model);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key.expose())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("no choices".to_string()))
    }
}

#[async_trait]
impl ImageProvider for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    async fn submit(&self, key: &ApiKey, job: &ImageJob) -> Result<Submission, ProviderError> {
        if job.init_image.is_some() {
            return Err(ProviderError::Unsupported("openai_compat image-to-image"));
        }

        let request = ImageRequest {
            model: job.model.clone(),
            prompt: job.prompt.clone(),
            negative_prompt: job.negative_prompt.clone(),
            n: 1,
            size: format!("{}x{}", job.width, job.height),
            seed: job.seed,
        };

        debug!("Sending image generation request: {}", request.model);

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(key.expose())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let image_response: ImageResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let first = image_response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("no image generated".to_string()))?;

        match (first.url, first.b64_json) {
            (Some(url), _) => Ok(Submission::Ready(ImageRef::Url(url))),
            (None, Some(b64)) => {
                let data = BASE64
                    .decode(b64)
                    .map_err(|e| ProviderError::Malformed(e.to_string()))?;
                Ok(Submission::Ready(ImageRef::Bytes {
                    data,
                    mime_type: "image/png".to_string(),
                }))
            }
            (None, None) => Err(ProviderError::Malformed("image without url or data".to_string())),
        }
    }

    async fn poll(&self, _key: &ApiKey, _task_id: &str) -> Result<TaskStatus, ProviderError> {
        // Every submission completes synchronously
        Err(ProviderError::Unsupported("openai_compat task polling"))
    }
}
