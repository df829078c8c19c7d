//! Account and session endpoints
//!
//! - `POST /auth/register`, `POST /auth/login`: open a session
//! - `POST /auth/logout`: end the bearer session
//! - `GET /auth/validate?token=`: session check for other services
//! - `GET /auth/me`, `POST /auth/preferences`, `POST /auth/password`

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{error_response, require_caller, AppState};
use crate::auth::accounts::{Account, AccountService, AuthError};
use crate::auth::parse_bearer;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/validate", get(validate))
        .route("/auth/me", get(me))
        .route("/auth/preferences", post(preferences))
        .route("/auth/password", post(change_password))
}

fn accounts(state: &AppState) -> AccountService {
    AccountService::new(state.db.pool().clone())
}

fn auth_error(e: AuthError) -> Response {
    let status = match e {
        AuthError::UsernameExists => StatusCode::CONFLICT,
        AuthError::MissingFields | AuthError::InvalidUsername | AuthError::WeakPassword => {
            StatusCode::BAD_REQUEST
        }
        AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        AuthError::AccountNotFound => StatusCode::NOT_FOUND,
        AuthError::Database(ref db) => {
            error!("Account storage error: {}", db);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "account storage unavailable");
        }
    };
    error_response(status, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

/// Session opened by register or login
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    #[serde(flatten)]
    pub account: AccountView,
}

/// Public view of an account
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub account_id: String,
    pub username: String,
    pub plan: &'static str,
    pub nsfw_enabled: bool,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            account_id: account.id,
            username: account.username,
            plan: account.plan.as_str(),
            nsfw_enabled: account.nsfw_enabled,
        }
    }
}

fn session(status: StatusCode, account: Account, token: String) -> Response {
    (
        status,
        Json(SessionResponse {
            token,
            account: account.into(),
        }),
    )
        .into_response()
}

async fn register(State(state): State<AppState>, Json(req): Json<CredentialsRequest>) -> Response {
    match accounts(&state).create_account(&req.username, &req.password).await {
        Ok((account, token)) => session(StatusCode::CREATED, account, token),
        Err(e) => auth_error(e),
    }
}

async fn login(State(state): State<AppState>, Json(req): Json<CredentialsRequest>) -> Response {
    match accounts(&state).login(&req.username, &req.password).await {
        Ok((account, token)) => session(StatusCode::OK, account, token),
        Err(e) => auth_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer);
    let Some(token) = token else {
        return error_response(StatusCode::UNAUTHORIZED, "authentication required");
    };

    match accounts(&state).logout(token).await {
        Ok(success) => Json(SuccessResponse { success }).into_response(),
        Err(e) => auth_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(flatten)]
    pub account: Option<AccountView>,
}

async fn validate(State(state): State<AppState>, Query(params): Query<ValidateQuery>) -> Response {
    let account = match accounts(&state).validate_token(&params.token).await {
        Ok(account) => account,
        Err(e) => return auth_error(e),
    };
    Json(ValidateResponse {
        valid: account.is_some(),
        account: account.map(AccountView::from),
    })
    .into_response()
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match accounts(&state).get_account(&caller.account_id).await {
        Ok(Some(account)) => Json(AccountView::from(account)).into_response(),
        Ok(None) => auth_error(AuthError::AccountNotFound),
        Err(e) => auth_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PreferencesRequest {
    pub nsfw_enabled: bool,
}

/// Set the caller's explicit-content opt-in
async fn preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PreferencesRequest>,
) -> Response {
    let caller = match require_caller(&state, &headers).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    match accounts(&state)
        .set_nsfw_enabled(&caller.account_id, req.nsfw_enabled)
        .await
    {
        Ok(()) => Json(SuccessResponse { success: true }).into_response(),
        Err(e) => auth_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub username: String,
    pub current_password: String,
    pub new_password: String,
}

/// Change a password; the old session ends and the caller must log in again
async fn change_password(State(state): State<AppState>, Json(req): Json<PasswordRequest>) -> Response {
    match accounts(&state)
        .change_password(&req.username, &req.current_password, &req.new_password)
        .await
    {
        Ok(()) => Json(SuccessResponse { success: true }).into_response(),
        Err(e) => auth_error(e),
    }
}
