//! HTTP surface: routing, shared state and caller resolution

mod assets;
mod auth;
mod characters;
mod generate;
mod images;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::access::Caller;
use crate::auth::accounts::AccountService;
use crate::auth::parse_bearer;
use crate::characters::CharacterStore;
use crate::credits::CreditLedger;
use crate::db::Database;
use crate::pipeline::Pipeline;
use crate::storage::{AssetStore, ImageStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub pipeline: Arc<Pipeline>,
    pub credits: CreditLedger,
    pub characters: CharacterStore,
    pub assets: AssetStore,
    pub image_store: ImageStore,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
        .route("/credits", get(credits))
        .route("/models", get(models))
        .merge(auth::router())
        .merge(generate::router())
        .merge(assets::router())
        .merge(characters::router())
        .nest("/images", images::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub(crate) fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Resolve the bearer token, if any, to a caller
///
/// No header means anonymous. A header with an unknown token is an error.
pub(crate) async fn caller_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Caller>, Response> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };

    let token = value
        .to_str()
        .ok()
        .and_then(parse_bearer)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "malformed authorization header"))?;

    let service = AccountService::new(state.db.pool().clone());
    match service.validate_token(token).await {
        Ok(Some(account)) => Ok(Some(account.caller())),
        Ok(None) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid or expired session")),
        Err(e) => {
            tracing::error!("Session lookup failed: {}", e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "session lookup failed"))
        }
    }
}

/// Like [`caller_from_headers`] but requires a session
pub(crate) async fn require_caller(state: &AppState, headers: &HeaderMap) -> Result<Caller, Response> {
    caller_from_headers(state, headers)
        .await?
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "authentication required"))
}

/// Root endpoint
async fn root() -> impl IntoResponse {
    Json(RootResponse {
        name: "portraitd",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                database: "ok",
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                database: "error",
            }),
        ),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
}

#[derive(Serialize)]
struct CreditsResponse {
    balance: i64,
    transactions: Vec<crate::credits::CreditTransaction>,
}

/// Current balance and recent ledger movements
async fn credits(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let balance = state.credits.get_balance(&caller.account_id).await;
    let history = state.credits.history(&caller.account_id, 20).await;

    match (balance, history) {
        (Ok(balance), Ok(transactions)) => Json(CreditsResponse {
            balance,
            transactions,
        })
        .into_response(),
        (Err(e), _) | (_, Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Serialize)]
struct ModelInfo {
    name: String,
    min_plan: &'static str,
    allows_nsfw: bool,
    min_pixels: u64,
}

#[derive(Serialize)]
struct PresetInfo {
    id: String,
    style: crate::prompt::Style,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
    presets: Vec<PresetInfo>,
}

/// Model catalogue and style presets
async fn models(State(state): State<AppState>) -> impl IntoResponse {
    let mut models: Vec<ModelInfo> = state
        .pipeline
        .catalog()
        .list()
        .into_iter()
        .map(|m| ModelInfo {
            name: m.name.clone(),
            min_plan: m.min_plan.as_str(),
            allows_nsfw: m.allows_nsfw,
            min_pixels: m.min_pixels,
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));

    let mut presets: Vec<PresetInfo> = state
        .pipeline
        .presets()
        .list()
        .into_iter()
        .map(|p| PresetInfo {
            id: p.id.clone(),
            style: p.style,
        })
        .collect();
    presets.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelsResponse { models, presets })
}
