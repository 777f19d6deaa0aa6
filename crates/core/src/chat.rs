use std::{
    collections::BTreeMap,
    convert::Infallible,
    time::{Duration, Instant},
};

use axum::{
    extract::{Multipart, Path, State},
    http::{header::HeaderName, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    dialogue::{DialogueRequest, OrchestrationResult, VectorSearchInfo, WidgetData},
    error::XiaoxingError,
    events::preview,
    AppState,
};

pub const FOOD_ANALYSIS_PROMPT: &str = "请分析这张图片中的食物，提供营养成分分析和健康建议";
const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ChatRequest {
    /// User message; must not be blank.
    pub message: String,
    /// Optional image, as an http(s) URL or a data URI.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Conversation scope; `default` when omitted.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ChatRequest {
    fn into_dialogue(self) -> DialogueRequest {
        DialogueRequest {
            user_input: self.message,
            image_url: self.image_url.filter(|url| !url.trim().is_empty()),
            session_id: self.session_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ChatResponse {
    pub response: String,
    pub widget: Option<WidgetData>,
    pub intent: String,
    /// Always `speak`; kept for the web client's avatar state machine.
    pub state: String,
    pub vector_search: Option<VectorSearchInfo>,
}

impl From<OrchestrationResult> for ChatResponse {
    fn from(result: OrchestrationResult) -> Self {
        Self {
            response: result.text_response,
            widget: result.widget_data,
            intent: result.intent,
            state: "speak".to_string(),
            vector_search: result.vector_search,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct FoodAnalysisResponse {
    pub analysis: String,
    pub recommendations: Option<WidgetData>,
    pub vector_search: Option<VectorSearchInfo>,
}

/// Multipart body of `/api/analyze-food`.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct FoodUpload {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: String,
    pub last_intent: Option<String>,
    pub turn_count: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SessionResetResponse {
    pub session_id: String,
    pub reset: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ErrorDetail {
    pub detail: String,
}

fn error_response(err: &XiaoxingError) -> (StatusCode, Json<ErrorDetail>) {
    let status = match err {
        XiaoxingError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let detail = match err {
        XiaoxingError::Validation(message) => message.clone(),
        other => other.to_string(),
    };
    (status, Json(ErrorDetail { detail }))
}

/// Whole milliseconds of `elapsed`, saturating at `u64::MAX`.
fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn chat_event_labels(intent: &str) -> BTreeMap<&'static str, serde_json::Value> {
    let mut labels = BTreeMap::new();
    labels.insert("intent", json!(intent));
    labels
}

#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Assistant reply, or the apology payload when an upstream failed", body = ChatResponse),
        (status = 400, description = "Blank message", body = ErrorDetail)
    ),
    tag = "chat"
)]
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(chat_request): Json<ChatRequest>,
) -> Response {
    let started = Instant::now();
    let request = chat_request.into_dialogue();
    info!(
        session = request.session_key(),
        chars = request.user_input.chars().count(),
        has_image = request.image_url.is_some(),
        "chat request received"
    );

    let knowledge = state.knowledge();
    let outcome = match state.orchestrator().process(&request, knowledge.items()).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "chat request rejected");
            let (status, body) = error_response(&err);
            state.record_http_observation(Method::POST, "/api/chat", status, started);
            return (status, body).into_response();
        }
    };

    let degraded = outcome.is_degraded();
    let result = outcome.into_result();
    let events = state.events();
    if events.is_enabled() {
        let labels = chat_event_labels(&result.intent);
        events.write(
            "chat.request",
            "info",
            labels.clone(),
            json!({ "message_preview": preview(&request.user_input, 120) }),
        );
        events.write(
            if degraded { "chat.degraded" } else { "chat.response" },
            if degraded { "error" } else { "info" },
            labels,
            json!({
                "response_preview": preview(&result.text_response, 160),
                "latency_ms": saturating_millis(started.elapsed()),
                "retrieved": result.vector_search.as_ref().map(|v| v.retrieved_count).unwrap_or(0),
            }),
        );
    }

    let status = StatusCode::OK;
    state.record_http_observation(Method::POST, "/api/chat", status, started);
    (status, Json(ChatResponse::from(result))).into_response()
}

#[utoipa::path(
    post,
    path = "/api/chat/stream",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Server-sent events: JSON fragments, then a literal [DONE]", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Blank message", body = ErrorDetail)
    ),
    tag = "chat"
)]
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    Json(chat_request): Json<ChatRequest>,
) -> Response {
    let started = Instant::now();
    let request = chat_request.into_dialogue();
    info!(
        session = request.session_key(),
        has_image = request.image_url.is_some(),
        "stream chat request received"
    );

    match state
        .orchestrator()
        .process_stream(request, state.knowledge())
    {
        Ok(fragments) => {
            let status = StatusCode::OK;
            state.record_http_observation(Method::POST, "/api/chat/stream", status, started);
            let events = fragments
                .map(|fragment| Ok::<Event, Infallible>(Event::default().data(fragment.to_data())));
            (
                [(HeaderName::from_static("x-accel-buffering"), "no")],
                Sse::new(events).keep_alive(KeepAlive::default()),
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, "stream chat request rejected");
            let (status, body) = error_response(&err);
            state.record_http_observation(Method::POST, "/api/chat/stream", status, started);
            (status, body).into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/analyze-food",
    request_body(content = FoodUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Nutrition analysis of the uploaded photo", body = FoodAnalysisResponse),
        (status = 400, description = "Missing or unreadable upload", body = ErrorDetail)
    ),
    tag = "chat"
)]
pub async fn analyze_food_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let started = Instant::now();
    let bad_request = |detail: String| {
        let status = StatusCode::BAD_REQUEST;
        state.record_http_observation(Method::POST, "/api/analyze-food", status, started);
        (status, Json(ErrorDetail { detail })).into_response()
    };

    let mut upload: Option<(String, Vec<u8>)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(UPLOAD_FIELD) => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                match field.bytes().await {
                    Ok(bytes) => upload = Some((content_type, bytes.to_vec())),
                    Err(err) => return bad_request(format!("failed to read upload: {err}")),
                }
                break;
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(err) => return bad_request(format!("invalid multipart body: {err}")),
        }
    }

    let Some((content_type, bytes)) = upload else {
        return bad_request(format!("missing '{UPLOAD_FIELD}' field"));
    };
    if bytes.is_empty() {
        return bad_request("uploaded file is empty".to_string());
    }

    info!(content_type = %content_type, bytes = bytes.len(), "food image received");
    let image_url = format!(
        "data:{content_type};base64,{}",
        BASE64_STANDARD.encode(&bytes)
    );
    let request = DialogueRequest::new(FOOD_ANALYSIS_PROMPT).with_image(image_url);

    let knowledge = state.knowledge();
    match state.orchestrator().process(&request, knowledge.items()).await {
        Ok(outcome) => {
            let result = outcome.into_result();
            let status = StatusCode::OK;
            state.record_http_observation(Method::POST, "/api/analyze-food", status, started);
            (
                status,
                Json(FoodAnalysisResponse {
                    analysis: result.text_response,
                    recommendations: result.widget_data,
                    vector_search: result.vector_search,
                }),
            )
                .into_response()
        }
        Err(err) => {
            let (status, body) = error_response(&err);
            state.record_http_observation(Method::POST, "/api/analyze-food", status, started);
            (status, body).into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/session/{id}",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Dialogue state of the session", body = SessionResponse),
        (status = 404, description = "Unknown session", body = ErrorDetail)
    ),
    tag = "chat"
)]
pub async fn session_get_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let started = Instant::now();
    match state.orchestrator().sessions().get(&session_id).await {
        Some(dialogue) => {
            let status = StatusCode::OK;
            state.record_http_observation(Method::GET, "/api/session/{id}", status, started);
            (
                status,
                Json(SessionResponse {
                    session_id,
                    last_intent: dialogue.last_intent.map(|i| i.as_str().to_string()),
                    turn_count: dialogue.turn_count,
                }),
            )
                .into_response()
        }
        None => {
            let status = StatusCode::NOT_FOUND;
            state.record_http_observation(Method::GET, "/api/session/{id}", status, started);
            (
                status,
                Json(ErrorDetail {
                    detail: format!("unknown session '{session_id}'"),
                }),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    delete,
    path = "/api/session/{id}",
    params(("id" = String, Path, description = "Session identifier")),
    responses((status = 200, description = "Session state cleared", body = SessionResetResponse)),
    tag = "chat"
)]
pub async fn session_reset_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<SessionResetResponse>) {
    let started = Instant::now();
    let reset = state.orchestrator().sessions().reset(&session_id).await;
    let status = StatusCode::OK;
    state.record_http_observation(Method::DELETE, "/api/session/{id}", status, started);
    (status, Json(SessionResetResponse { session_id, reset }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_millis_saturate() {
        assert_eq!(saturating_millis(Duration::from_millis(1_250)), 1_250);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err = XiaoxingError::Validation("消息内容不能为空".into());
        let (status, body) = error_response(&err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0.detail, "消息内容不能为空");

        let (status, _) = error_response(&XiaoxingError::Config("bad".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn blank_image_urls_are_dropped() {
        let request = ChatRequest {
            message: "早餐".into(),
            image_url: Some("  ".into()),
            session_id: None,
        }
        .into_dialogue();
        assert!(request.image_url.is_none());
        assert_eq!(request.session_key(), "default");
    }
}
