//! Character profile endpoints

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{error_response, require_caller, AppState};
use crate::characters::{CharacterError, EntityProfile, Metadata, VisualTraits};

/// Build the characters router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/characters", get(list_characters).post(create_character))
        .route(
            "/characters/{id}",
            get(get_character)
                .put(update_character)
                .delete(delete_character),
        )
}

/// Create/update body
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CharacterBody {
    pub name: String,
    pub is_public: bool,
    pub traits: VisualTraits,
    pub personality: String,
    pub metadata: Metadata,
    pub face_image_url: Option<String>,
    pub anatomy_image_url: Option<String>,
}

impl CharacterBody {
    fn apply(self, profile: &mut EntityProfile) {
        profile.name = self.name;
        profile.is_public = self.is_public;
        profile.traits = self.traits;
        profile.personality = self.personality;
        profile.metadata = self.metadata;
        profile.face_image_url = self.face_image_url;
        profile.anatomy_image_url = self.anatomy_image_url;
    }
}

#[derive(Debug, Serialize)]
struct CharactersResponse {
    characters: Vec<EntityProfile>,
}

fn store_error(e: CharacterError) -> Response {
    match e {
        CharacterError::MissingName => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

async fn list_characters(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.characters.list_visible(&caller.account_id).await {
        Ok(characters) => Json(CharactersResponse { characters }).into_response(),
        Err(e) => store_error(e),
    }
}

async fn create_character(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CharacterBody>,
) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let mut profile = EntityProfile::new(&body.name, Some(&caller.account_id));
    body.apply(&mut profile);

    match state.characters.create(&profile).await {
        Ok(()) => (StatusCode::CREATED, Json(profile)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_character(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.characters.snapshot(&id, Some(&caller.account_id)).await {
        Ok(Some(profile)) => Json(profile).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "character not found"),
        Err(e) => store_error(e),
    }
}

async fn update_character(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CharacterBody>,
) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let mut profile = match state.characters.get(&id).await {
        Ok(Some(p)) if p.owner_id.as_deref() == Some(caller.account_id.as_str()) => p,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "character not found"),
        Err(e) => return store_error(e),
    };

    if body.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "character name is required");
    }
    body.apply(&mut profile);

    match state.characters.update(&profile).await {
        Ok(true) => Json(profile).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "character not found"),
        Err(e) => store_error(e),
    }
}

async fn delete_character(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match state.characters.delete(&id, &caller.account_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "character not found"),
        Err(e) => store_error(e),
    }
}
