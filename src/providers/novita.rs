//! Novita async task API
//!
//! - `POST /v3/async/txt2img` and `/v3/async/img2img` return a task handle
//! - `GET /v3/async/task-result?task_id=` reports the task state
//! - `POST /v3/merge-face` swaps a face synchronously

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    api_error, FaceSwapProvider, ImageJob, ImageProvider, ImageRef, ProviderError, Submission,
    TaskStatus,
};
use crate::credentials::ApiKey;

#[derive(Debug, Serialize)]
struct Extra {
    response_image_type: &'static str,
}

const EXTRA: Extra = Extra {
    response_image_type: "jpeg",
};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    extra: &'a Extra,
    request: GenerateParams,
}

#[derive(Debug, Serialize)]
struct GenerateParams {
    model_name: String,
    prompt: String,
    negative_prompt: String,
    width: u32,
    height: u32,
    image_num: u32,
    steps: u32,
    seed: i64,
    guidance_scale: f32,
    sampler_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strength: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct TaskHandle {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    task: TaskInfo,
    #[serde(default)]
    images: Vec<TaskImage>,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    status: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct TaskImage {
    image_url: String,
}

#[derive(Debug, Serialize)]
struct MergeFaceRequest<'a> {
    face_image_file: String,
    image_file: String,
    extra: &'a Extra,
}

#[derive(Debug, Deserialize)]
struct MergeFaceResponse {
    image_file: String,
    #[serde(default)]
    image_type: Option<String>,
}

/// Novita API client
#[derive(Debug, Clone)]
pub struct NovitaClient {
    client: Client,
    base_url: String,
}

impl NovitaClient {
    /// Create a new client against `base_url` (e.g. `https://api.novita.ai`)
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Map a Novita task status string onto [`TaskStatus`]
fn parse_status(result: TaskResult) -> Result<TaskStatus, ProviderError> {
    match result.task.status.as_str() {
        "TASK_STATUS_QUEUED" => Ok(TaskStatus::Queued),
        "TASK_STATUS_PROCESSING" => Ok(TaskStatus::Running),
        "TASK_STATUS_SUCCEED" => result
            .images
            .into_iter()
            .next()
            .map(|img| TaskStatus::Succeeded(ImageRef::Url(img.image_url)))
            .ok_or_else(|| ProviderError::Malformed("succeeded task without images".to_string())),
        "TASK_STATUS_FAILED" => Ok(TaskStatus::Failed(if result.task.reason.is_empty() {
            "task failed".to_string()
        } else {
            result.task.reason
        })),
        other => Err(ProviderError::Malformed(format!("unknown task status {}", other))),
    }
}

#[async_trait]
impl ImageProvider for NovitaClient {
    fn name(&self) -> &'static str {
        "novita"
    }

    async fn submit(&self, key: &ApiKey, job: &ImageJob) -> Result<Submission, ProviderError> {
        let (endpoint, image_base64, strength) = match &job.init_image {
            Some(image) => (
                "img2img",
                Some(image.to_base64(&self.client).await?),
                Some(job.strength),
            ),
            None => ("txt2img", None, None),
        };

        let request = GenerateRequest {
            extra: &EXTRA,
            request: GenerateParams {
                model_name: job.model.clone(),
                prompt: job.prompt.clone(),
                negative_prompt: job.negative_prompt.clone(),
                width: job.width,
                height: job.height,
                image_num: 1,
                steps: job.steps,
                seed: i64::from(job.seed),
                guidance_scale: job.guidance_scale,
                sampler_name: "DPM++ 2M Karras",
                image_base64,
                strength,
            },
        };

        debug!("Submitting Novita {} task: {}", endpoint, job.model);

        let response = self
            .client
            .post(format!("{}/v3/async/{}", self.base_url, endpoint))
            .bearer_auth(key.expose())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let handle: TaskHandle = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(Submission::Pending(handle.task_id))
    }

    async fn poll(&self, key: &ApiKey, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v3/async/task-result", self.base_url))
            .query(&[("task_id", task_id)])
            .bearer_auth(key.expose())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let result: TaskResult = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        parse_status(result)
    }
}

#[async_trait]
impl FaceSwapProvider for NovitaClient {
    async fn swap_face(
        &self,
        key: &ApiKey,
        face: &ImageRef,
        target: &ImageRef,
    ) -> Result<ImageRef, ProviderError> {
        let request = MergeFaceRequest {
            face_image_file: face.to_base64(&self.client).await?,
            image_file: target.to_base64(&self.client).await?,
            extra: &EXTRA,
        };

        debug!("Submitting Novita merge-face");

        let response = self
            .client
            .post(format!("{}/v3/merge-face", self.base_url))
            .bearer_auth(key.expose())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let merged: MergeFaceResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let data = BASE64
            .decode(merged.image_file)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(ImageRef::Bytes {
            data,
            mime_type: format!("image/{}", merged.image_type.as_deref().unwrap_or("jpeg")),
        })
    }
}
