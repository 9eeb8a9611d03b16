//! HTTP front door
//!
//! Routes, the primary `/chat` surface, health and readiness, and the
//! system-status endpoint. Streaming responses are newline-delimited
//! JSON; one event object per line, terminated by `done`.

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::{Json, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use orbit_core::{ChatEvent, Error, MetadataFilter, SourceEntry};
use orbit_pipeline::{ChatRequest, ChatStream};

use crate::admin;
use crate::auth;
use crate::mcp;
use crate::metrics::metrics_handler;
use crate::openai;
use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    let cors_layer =
        build_cors_layer(&state.settings.server.cors_origins, state.settings.server.cors_enabled);

    Router::new()
        // Chat surfaces
        .route("/chat", post(chat))
        .route("/v1/chat/completions", post(openai::completions))
        .route("/mcp", post(mcp::rpc))
        // Health
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics_handler))
        // Admin plane
        .route("/admin/system-status", get(system_status))
        .route("/admin/api-keys", post(admin::create_key).get(admin::list_keys))
        .route("/admin/api-keys/:token", get(admin::key_status).delete(admin::delete_key))
        .route("/admin/api-keys/:token/deactivate", post(admin::deactivate_key))
        .route("/admin/api-keys/:token/rename", post(admin::rename_key))
        .route("/admin/api-keys/:token/prompt", post(admin::associate_prompt))
        .route("/admin/prompts", post(admin::create_prompt).get(admin::list_prompts))
        .route(
            "/admin/prompts/:id",
            get(admin::get_prompt).put(admin::update_prompt).delete(admin::delete_prompt),
        )
        // Admin-plane user auth
        .route("/auth/register", post(admin::register))
        .route("/auth/login", post(admin::login))
        .route("/auth/logout", post(admin::logout))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins. Permissive only when
/// CORS is explicitly disabled.
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!(%origin, "invalid CORS origin ignored");
                None
            })
        })
        .collect();

    let allowed_headers = [
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        HeaderName::from_static(auth::API_KEY_HEADER),
        HeaderName::from_static(auth::SESSION_HEADER),
    ];

    if parsed.is_empty() {
        tracing::info!("no CORS origins configured, defaulting to localhost:3000");
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().expect("static origin"))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers(allowed_headers);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(allowed_headers)
        .allow_credentials(true)
}

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Restrict file-retriever adapters to these uploaded files
    #[serde(default)]
    pub file_ids: Option<Vec<String>>,
}

/// Non-streaming response of `POST /chat`.
#[derive(Debug, Serialize)]
struct ChatJsonResponse {
    response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<Vec<SourceEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Primary chat endpoint.
async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Response {
    let api_key = auth::api_key(&headers);

    if let Some(key) = &api_key {
        if !state.rate_limiter.check(key) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({ "error": "rate limit exceeded" })),
            )
                .into_response();
        }
    }

    let stream_requested = body.stream.unwrap_or(true);
    let cancel = CancellationToken::new();
    let request = ChatRequest {
        api_key,
        session_id: auth::session_id(&headers),
        message: body.message,
        stream: stream_requested,
        params: None,
        filters: file_filters(body.file_ids),
        cancel: cancel.clone(),
    };

    match state.pipeline.execute(request).await {
        Err(e) => error_response(&e),
        Ok(stream) if stream_requested => ndjson_response(stream, cancel),
        Ok(stream) => collected_response(stream).await,
    }
}

pub(crate) fn file_filters(file_ids: Option<Vec<String>>) -> Vec<MetadataFilter> {
    file_ids
        .unwrap_or_default()
        .into_iter()
        .map(|id| MetadataFilter::eq("file_id", id))
        .collect()
}

/// Map a pre-stream failure onto its HTTP status.
pub(crate) fn error_response(error: &Error) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    tracing::warn!(class = error.class(), "request rejected");
    (status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}

/// Stream events as `application/x-ndjson`. Dropping the response body
/// (client disconnect) fires the cancellation token.
pub(crate) fn ndjson_response(stream: ChatStream, cancel: CancellationToken) -> Response {
    let ChatStream { session_id, events } = stream;

    let guard = cancel.drop_guard();
    let body = Body::from_stream(events.map(move |event| {
        let _held = &guard;
        Ok::<_, Infallible>(Bytes::from(event.to_line()))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(auth::SESSION_HEADER, session_id)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Consume the full event stream internally and answer with one JSON
/// object.
pub(crate) async fn collected_response(stream: ChatStream) -> Response {
    let ChatStream { session_id, mut events } = stream;

    let mut response = String::new();
    let mut sources: Option<Vec<SourceEntry>> = None;
    let mut error: Option<String> = None;

    while let Some(event) = events.next().await {
        match event {
            ChatEvent::Text { content } => response.push_str(&content),
            ChatEvent::Sources { content } => sources = Some(content),
            ChatEvent::Error { content } => error = Some(content),
            ChatEvent::Audio { .. } => {}
            ChatEvent::Done => break,
        }
    }

    let body = ChatJsonResponse { response, sources, error };
    (
        StatusCode::OK,
        [(auth::SESSION_HEADER, session_id)],
        Json(body),
    )
        .into_response()
}

/// Liveness.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: no critical target's circuit may be open.
async fn ready(State(state): State<AppState>) -> Response {
    let snapshots = state.supervisor.snapshots();
    let open: Vec<&str> = snapshots
        .iter()
        .filter(|s| s.state == orbit_supervisor::CircuitState::Open)
        .map(|s| s.target.as_str())
        .collect();

    if open.is_empty() {
        Json(serde_json::json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "degraded", "open_circuits": open })),
        )
            .into_response()
    }
}

/// Circuit states, uptime, and adapter health.
async fn system_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(status) = auth::authorize_admin(&state, &headers).await {
        return status.into_response();
    }

    let adapters = state.registry.health().await;
    Json(serde_json::json!({
        "uptime_secs": state.uptime_secs(),
        "circuits": state.supervisor.snapshots(),
        "adapters": adapters,
        "providers": state.clients.provider_names(),
    }))
    .into_response()
}
