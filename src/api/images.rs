//! Durable image delivery
//!
//! `GET /images/{hash}` serves bytes persisted by the generation pipeline.
//! Content is addressed by its SHA-256, so responses never change and are
//! cached forever; a matching `If-None-Match` gets a bare 304.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::error;

use super::{error_response, AppState};

const IMMUTABLE: &str = "public, max-age=31536000, immutable";

pub fn router() -> Router<AppState> {
    Router::new().route("/{hash}", get(serve_image))
}

fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn serve_image(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !is_content_hash(&hash) {
        return error_response(StatusCode::NOT_FOUND, "image not found");
    }

    let etag = format!("\"{}\"", hash);
    let cached = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag));
    if cached {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }

    match state.image_store.get(&hash).await {
        Ok(Some(image)) => (
            [
                (header::CONTENT_TYPE, image.mime_type),
                (header::CACHE_CONTROL, IMMUTABLE.to_string()),
                (header::ETAG, etag),
            ],
            image.data,
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "image not found"),
        Err(e) => {
            error!("Image lookup {} failed: {}", hash, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "image lookup failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_shape() {
        assert!(is_content_hash(&"ab".repeat(32)));
        assert!(!is_content_hash("abc"));
        assert!(!is_content_hash(&"zz".repeat(32)));
    }
}
