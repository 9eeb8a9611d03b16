//! Model-Context-Protocol surface
//!
//! `POST /mcp` carries a JSON-RPC 2.0 envelope. `chat.stream` answers
//! with newline-delimited JSON-RPC notifications wrapping the chat
//! event envelope; `chat` answers with a single response object after
//! consuming the backend stream internally.

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::{Json, State},
    http::{header, StatusCode, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use orbit_core::{ChatEvent, Error};
use orbit_pipeline::{ChatRequest, ChatStream};

use crate::auth;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RpcEnvelope {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: ChatParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatParams {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `POST /mcp`
pub async fn rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<RpcEnvelope>,
) -> Response {
    if envelope.jsonrpc != "2.0" {
        return rpc_error(&envelope.id, -32600, "unsupported jsonrpc version", StatusCode::BAD_REQUEST);
    }

    let streaming = match envelope.method.as_str() {
        "chat.stream" => true,
        "chat" => false,
        _ => {
            return rpc_error(
                &envelope.id,
                -32601,
                &format!("unknown method '{}'", envelope.method),
                StatusCode::BAD_REQUEST,
            )
        }
    };
    if envelope.params.message.trim().is_empty() {
        return rpc_error(&envelope.id, -32602, "params.message is required", StatusCode::BAD_REQUEST);
    }

    let cancel = CancellationToken::new();
    let request = ChatRequest {
        api_key: auth::api_key(&headers),
        session_id: envelope.params.session_id.clone().or_else(|| auth::session_id(&headers)),
        message: envelope.params.message.clone(),
        stream: streaming,
        params: None,
        filters: Vec::new(),
        cancel: cancel.clone(),
    };

    match state.pipeline.execute(request).await {
        Err(e) => {
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let code = match e {
                Error::Validation(_) => -32602,
                Error::Auth(_) => -32001,
                _ => -32000,
            };
            rpc_error(&envelope.id, code, &e.to_string(), status)
        }
        Ok(stream) if streaming => stream_response(stream, cancel, envelope.id),
        Ok(stream) => single_response(stream, envelope.id).await,
    }
}

fn rpc_error(id: &Value, code: i64, message: &str, status: StatusCode) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        })),
    )
        .into_response()
}

/// NDJSON: one JSON-RPC notification per chat event, then a final
/// response carrying the `done` event.
fn stream_response(stream: ChatStream, cancel: CancellationToken, id: Value) -> Response {
    let ChatStream { session_id, events } = stream;

    let guard = cancel.drop_guard();
    let body = Body::from_stream(events.map(move |event| {
        let _held = &guard;
        let frame = if matches!(event, ChatEvent::Done) {
            json!({ "jsonrpc": "2.0", "id": id.clone(), "result": event })
        } else {
            json!({ "jsonrpc": "2.0", "method": "chat.event", "params": event })
        };
        Ok::<_, Infallible>(Bytes::from(format!("{frame}\n")))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(auth::SESSION_HEADER, session_id)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn single_response(stream: ChatStream, id: Value) -> Response {
    let ChatStream { session_id, mut events } = stream;

    let mut text = String::new();
    let mut sources: Option<Value> = None;
    let mut error: Option<String> = None;
    while let Some(event) = events.next().await {
        match event {
            ChatEvent::Text { content } => text.push_str(&content),
            ChatEvent::Sources { content } => {
                sources = serde_json::to_value(content).ok();
            }
            ChatEvent::Error { content } => error = Some(content),
            ChatEvent::Done => break,
            ChatEvent::Audio { .. } => {}
        }
    }

    let body = match error {
        Some(message) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32000, "message": message },
        }),
        None => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "response": text, "sources": sources },
        }),
    };

    (StatusCode::OK, [(auth::SESSION_HEADER, session_id)], Json(body)).into_response()
}
