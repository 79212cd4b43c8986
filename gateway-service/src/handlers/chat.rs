use axum::{
    extract::{Query, State},
    http::{header::HeaderName, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    Json,
};
use futures::{stream, StreamExt};
use serde_json::Value;
use service_core::error::AppError;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    dtos::{ChatRequest, ChatResponse, ChatStatusResponse, ClearHistoryQuery, ClearHistoryResponse},
    middleware::AuthCaller,
    utils::ValidatedJson,
    AppState,
};

const DONE_MARKER: &str = "[DONE]";

/// Stream the answer as server-sent events, ending with `data: [DONE]`.
pub async fn stream(
    State(state): State<AppState>,
    AuthCaller(caller): AuthCaller,
    ValidatedJson(req): ValidatedJson<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rx = state
        .gateway
        .open_stream(caller, req.question, req.session_id)
        .await?;

    let events = ReceiverStream::new(rx)
        .map(|event| Event::default().json_data(event))
        .chain(stream::once(async {
            Ok::<_, axum::Error>(Event::default().data(DONE_MARKER))
        }));

    Ok((
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(events),
    ))
}

/// Same pipeline as [`stream`], collected into one JSON response.
pub async fn query(
    State(state): State<AppState>,
    AuthCaller(caller): AuthCaller,
    ValidatedJson(req): ValidatedJson<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let session_id = req.session_id.clone();
    let result = state
        .gateway
        .query(caller, req.question, req.session_id)
        .await?;

    Ok(Json(ChatResponse {
        success: true,
        execution_time: result.metadata.get("execution_time").and_then(Value::as_f64),
        response: result.response,
        session_id,
        metadata: result.metadata,
    }))
}

pub async fn clear_history(
    State(state): State<AppState>,
    Query(params): Query<ClearHistoryQuery>,
) -> Json<ClearHistoryResponse> {
    state.gateway.clear_session(&params.session_id);

    Json(ClearHistoryResponse {
        success: true,
        message: format!("History cleared for session {}", params.session_id),
    })
}

pub async fn status(State(state): State<AppState>) -> Json<ChatStatusResponse> {
    let model = state.gateway.responder_model().map(str::to_string);

    Json(ChatStatusResponse {
        available: model.is_some(),
        model,
    })
}
