//! Admin plane: API key CRUD, prompt CRUD, user auth

use axum::{
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use orbit_core::Error;

use crate::auth::authorize_admin;
use crate::state::AppState;

fn store_error(e: Error) -> Response {
    tracing::error!(error = %e, "admin operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

macro_rules! require_admin {
    ($state:expr, $headers:expr) => {
        if let Err(status) = authorize_admin(&$state, &$headers).await {
            return status.into_response();
        }
    };
}

// --- API keys ---

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub client_name: String,
    pub adapter_name: String,
    #[serde(default)]
    pub system_prompt_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// `POST /admin/api-keys`
pub async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Response {
    require_admin!(state, headers);

    // Keys bind to adapters by name; an unknown adapter is rejected
    // here, never silently fallen back at request time.
    if !state.registry.contains(&body.adapter_name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown adapter '{}'", body.adapter_name) })),
        )
            .into_response();
    }

    if let Some(prompt_id) = &body.system_prompt_id {
        match state.prompts.get(prompt_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("unknown prompt '{prompt_id}'") })),
                )
                    .into_response()
            }
            Err(e) => return store_error(e),
        }
    }

    match state
        .keys
        .create_key(
            &body.client_name,
            &body.adapter_name,
            body.system_prompt_id.as_deref(),
            body.notes.as_deref(),
        )
        .await
    {
        Ok(record) => (StatusCode::CREATED, Json(json!(record))).into_response(),
        Err(e) => store_error(e),
    }
}

/// `GET /admin/api-keys`
pub async fn list_keys(State(state): State<AppState>, headers: HeaderMap) -> Response {
    require_admin!(state, headers);
    match state.keys.list().await {
        Ok(records) => {
            let count = records.len();
            Json(json!({ "keys": records, "count": count })).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// `GET /admin/api-keys/{token}`
pub async fn key_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    require_admin!(state, headers);
    match state.keys.get(&token).await {
        Ok(Some(record)) => Json(json!(record)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

/// `DELETE /admin/api-keys/{token}`
pub async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    require_admin!(state, headers);
    match state.keys.delete(&token).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

/// `POST /admin/api-keys/{token}/deactivate`
pub async fn deactivate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    require_admin!(state, headers);
    match state.keys.deactivate(&token).await {
        Ok(true) => Json(json!({ "status": "deactivated" })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub client_name: String,
}

/// `POST /admin/api-keys/{token}/rename`
pub async fn rename_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(body): Json<RenameBody>,
) -> Response {
    require_admin!(state, headers);
    match state.keys.rename(&token, &body.client_name).await {
        Ok(true) => Json(json!({ "status": "renamed" })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AssociateBody {
    pub system_prompt_id: String,
}

/// `POST /admin/api-keys/{token}/prompt`
pub async fn associate_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(body): Json<AssociateBody>,
) -> Response {
    require_admin!(state, headers);
    match state.prompts.associate(&token, &body.system_prompt_id).await {
        Ok(true) => Json(json!({ "status": "associated" })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

// --- Prompts ---

#[derive(Debug, Deserialize)]
pub struct PromptBody {
    pub name: String,
    pub text: String,
}

/// `POST /admin/prompts`
pub async fn create_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PromptBody>,
) -> Response {
    require_admin!(state, headers);
    match state.prompts.create(&body.name, &body.text).await {
        Ok(prompt) => (StatusCode::CREATED, Json(json!(prompt))).into_response(),
        Err(e) => store_error(e),
    }
}

/// `GET /admin/prompts`
pub async fn list_prompts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    require_admin!(state, headers);
    match state.prompts.list().await {
        Ok(prompts) => {
            let count = prompts.len();
            Json(json!({ "prompts": prompts, "count": count })).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// `GET /admin/prompts/{id}`
pub async fn get_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    require_admin!(state, headers);
    match state.prompts.get(&id).await {
        Ok(Some(prompt)) => Json(json!(prompt)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdatePromptBody {
    pub text: String,
}

/// `PUT /admin/prompts/{id}`
pub async fn update_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdatePromptBody>,
) -> Response {
    require_admin!(state, headers);
    match state.prompts.update(&id, &body.text).await {
        Ok(Some(prompt)) => Json(json!(prompt)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

/// `DELETE /admin/prompts/{id}`
pub async fn delete_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    require_admin!(state, headers);
    match state.prompts.delete(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

// --- Admin users ---

#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    pub username: String,
    pub password: String,
}

/// `POST /auth/register`
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CredentialsBody>,
) -> Response {
    // Same gate as the rest of the admin plane: open only in dev mode
    // or to an authorized caller.
    require_admin!(state, headers);

    match state.users.register(&body.username, &body.password).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(json!({ "id": record.id, "username": record.username })),
        )
            .into_response(),
        Err(Error::Validation(message)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> Response {
    match state.users.verify(&body.username, &body.password).await {
        Ok(Some(record)) => {
            let token = state.admin_sessions.issue(&record.username);
            Json(json!({ "token": token, "username": record.username })).into_response()
        }
        Ok(None) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response(),
        Err(e) => store_error(e),
    }
}

/// `POST /auth/logout`
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if state.admin_sessions.revoke(token) => {
            Json(json!({ "status": "logged_out" })).into_response()
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}
