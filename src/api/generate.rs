//! Generation endpoint family
//!
//! POST /generate/text-to-image
//! POST /generate/image-to-image
//! POST /generate/character
//! POST /generate/style-preset

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{caller_from_headers, AppState};
use crate::pipeline::{Flavor, GenerationOutcome, GenerationRequest, PipelineError};
use crate::postprocess::SkippedStage;

/// Build the generation router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate/text-to-image", post(text_to_image))
        .route("/generate/image-to-image", post(image_to_image))
        .route("/generate/character", post(character))
        .route("/generate/style-preset", post(style_preset))
}

/// Request body shared by every flavor
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(alias = "characterId")]
    pub character_id: Option<String>,
    #[serde(alias = "referenceImage", alias = "image_url", alias = "imageUrl")]
    pub reference_image: Option<String>,
    pub model: Option<String>,
    pub style: Option<String>,
    pub preset: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u32>,
    pub strength: Option<f32>,
    pub enhance: Option<bool>,
}

impl GenerateBody {
    fn into_request(self, flavor: Flavor) -> GenerationRequest {
        GenerationRequest {
            flavor,
            prompt: self.prompt,
            character_id: self.character_id,
            reference_image: self.reference_image,
            model: self.model,
            style: self.style,
            preset: self.preset,
            width: self.width,
            height: self.height,
            seed: self.seed,
            strength: self.strength,
            enhance: self.enhance,
        }
    }
}

/// Response body for every flavor, success or failure
#[derive(Debug, Default, Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_stages: Option<Vec<SkippedStage>>,
}

impl From<GenerationOutcome> for GenerateResponse {
    fn from(outcome: GenerationOutcome) -> Self {
        let degraded = outcome.is_degraded();
        Self {
            success: true,
            images: Some(vec![outcome.image_url.clone()]),
            image_url: Some(outcome.image_url),
            task_id: Some(outcome.task_id),
            model: Some(outcome.model),
            seed: Some(outcome.seed),
            degraded: degraded.then_some(true),
            skipped_stages: degraded.then_some(outcome.skipped_stages),
            ..Default::default()
        }
    }
}

/// HTTP status for a pipeline error
pub fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Auth(_) => StatusCode::UNAUTHORIZED,
        PipelineError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        PipelineError::Entitlement { .. } => StatusCode::FORBIDDEN,
        PipelineError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        PipelineError::Provider(_) | PipelineError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let upgrade_required = match &self {
            PipelineError::Entitlement { .. } | PipelineError::InsufficientCredits { .. } => {
                Some(self.upgrade_required())
            }
            _ => None,
        };
        let body = GenerateResponse {
            success: false,
            error: Some(self.to_string()),
            upgrade_required,
            ..Default::default()
        };
        (status, Json(body)).into_response()
    }
}

fn failure(status: StatusCode, error: String) -> Response {
    let body = GenerateResponse {
        success: false,
        error: Some(error),
        ..Default::default()
    };
    (status, Json(body)).into_response()
}

async fn handle(
    state: AppState,
    headers: HeaderMap,
    flavor: Flavor,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("Rejected {} body: {}", flavor.as_str(), rejection.body_text());
            return failure(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let caller = match caller_from_headers(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) if response.status() == StatusCode::UNAUTHORIZED => {
            return PipelineError::Auth("invalid or expired session".to_string()).into_response()
        }
        Err(response) => return failure(response.status(), "session lookup failed".to_string()),
    };

    match state
        .pipeline
        .run(caller.as_ref(), body.into_request(flavor))
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(GenerateResponse::from(outcome))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn text_to_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Response {
    handle(state, headers, Flavor::TextToImage, body).await
}

async fn image_to_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Response {
    handle(state, headers, Flavor::ImageToImage, body).await
}

async fn character(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Response {
    handle(state, headers, Flavor::Character, body).await
}

async fn style_preset(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Response {
    handle(state, headers, Flavor::StylePreset, body).await
}
