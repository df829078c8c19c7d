//! Generated asset endpoints
//!
//! GET    /assets       - caller's assets, newest first
//! DELETE /assets/{id}  - owner-only delete

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{error_response, require_caller, AppState};
use crate::storage::{Asset, ImageStore};

/// Build the assets router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/assets", get(list_assets))
        .route("/assets/{id}", delete(delete_asset))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct AssetsResponse {
    assets: Vec<Asset>,
}

async fn list_assets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    match state.assets.list(&caller.account_id, limit).await {
        Ok(assets) => Json(AssetsResponse { assets }).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_asset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.assets.delete(&id, &caller.account_id).await {
        Ok(Some(url)) => {
            // Locally stored bytes lose one reference
            if let Some(hash) = ImageStore::hash_from_url(&url) {
                if let Err(e) = state.image_store.release(hash).await {
                    warn!("Could not release image {}: {}", hash, e);
                }
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "asset not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
