//! OpenAI-compatible chat surface
//!
//! `POST /v1/chat/completions` maps onto the same pipeline. The last
//! user message in the body is the turn's message; prior turns come
//! from the server-side session, correlated via `X-Session-ID`.

use axum::{
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use axum::body::{Body, Bytes};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_util::sync::CancellationToken;

use orbit_core::{ChatEvent, Error, GenerationParams};
use orbit_pipeline::{ChatRequest, ChatStream};

use crate::auth;
use crate::http::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CompletionsBody {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// `POST /v1/chat/completions`
pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CompletionsBody>,
) -> Response {
    let Some(message) = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
    else {
        return error_response(&Error::Validation("no user message in request".into()));
    };

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

    let params = GenerationParams {
        model: body.model.clone().unwrap_or_default(),
        temperature: body.temperature,
        top_p: body.top_p,
        max_tokens: body.max_tokens,
        stop_tokens: body.stop.clone(),
        stream: body.stream,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let request = ChatRequest {
        api_key,
        session_id: auth::session_id(&headers),
        message,
        stream: body.stream,
        params: Some(params),
        filters: Vec::new(),
        cancel: cancel.clone(),
    };

    let completion_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let model = body.model.unwrap_or_else(|| "orbit".into());

    match state.pipeline.execute(request).await {
        Err(e) => error_response(&e),
        Ok(stream) if body.stream => sse_response(stream, cancel, completion_id, model),
        Ok(stream) => json_response(stream, completion_id, model).await,
    }
}

/// SSE stream of `chat.completion.chunk` objects, ending in `[DONE]`.
fn sse_response(
    stream: ChatStream,
    cancel: CancellationToken,
    completion_id: String,
    model: String,
) -> Response {
    let ChatStream { session_id, events } = stream;

    let guard = cancel.drop_guard();
    let body = Body::from_stream(events.filter_map(move |event| {
        let _held = &guard;
        let completion_id = completion_id.clone();
        let model = model.clone();
        async move {
            let frame = match event {
                ChatEvent::Text { content } => Some(chunk_frame(&completion_id, &model, Some(content), None)),
                ChatEvent::Error { content } => {
                    Some(format!("data: {}\n\n", serde_json::json!({ "error": { "message": content } })))
                }
                ChatEvent::Done => Some(format!(
                    "{}data: [DONE]\n\n",
                    chunk_frame(&completion_id, &model, None, Some("stop"))
                )),
                ChatEvent::Sources { .. } | ChatEvent::Audio { .. } => None,
            };
            frame.map(|f| Ok::<_, Infallible>(Bytes::from(f)))
        }
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(auth::SESSION_HEADER, session_id)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn chunk_frame(id: &str, model: &str, content: Option<String>, finish: Option<&str>) -> String {
    let delta = match content {
        Some(text) => serde_json::json!({ "content": text }),
        None => serde_json::json!({}),
    };
    let payload = serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish }],
    });
    format!("data: {payload}\n\n")
}

/// Non-streaming completion object. The backend stream is still fully
/// consumed internally.
async fn json_response(stream: ChatStream, completion_id: String, model: String) -> Response {
    let ChatStream { session_id, mut events } = stream;

    let mut text = String::new();
    let mut error: Option<String> = None;
    while let Some(event) = events.next().await {
        match event {
            ChatEvent::Text { content } => text.push_str(&content),
            ChatEvent::Error { content } => error = Some(content),
            ChatEvent::Done => break,
            _ => {}
        }
    }

    if let Some(message) = error {
        return (
            StatusCode::BAD_GATEWAY,
            [(auth::SESSION_HEADER, session_id)],
            Json(serde_json::json!({ "error": { "message": message } })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(auth::SESSION_HEADER, session_id)],
        Json(serde_json::json!({
            "id": completion_id,
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop",
            }],
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_user_message_selected() {
        let body: CompletionsBody = serde_json::from_str(
            r#"{"messages":[
                {"role":"system","content":"be terse"},
                {"role":"user","content":"first"},
                {"role":"assistant","content":"reply"},
                {"role":"user","content":"second"}
            ]}"#,
        )
        .unwrap();
        let message = body.messages.iter().rev().find(|m| m.role == "user").unwrap();
        assert_eq!(message.content, "second");
        assert!(!body.stream);
    }

    #[test]
    fn test_chunk_frame_shape() {
        let frame = chunk_frame("chatcmpl-1", "orbit", Some("hi".into()), None);
        assert!(frame.starts_with("data: "));
        let value: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");
    }
}
