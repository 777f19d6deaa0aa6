use axum::error_handling::HandleErrorLayer;
use axum::extract::{DefaultBodyLimit, FromRef};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tower::{limit::ConcurrencyLimitLayer, timeout::TimeoutLayer, BoxError, ServiceBuilder};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use xiaoxing_knowledge::{router as knowledge_router, KnowledgeState, KnowledgeStore, MetricsRecorder};

pub mod chat;
pub mod chat_upstream;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod events;
pub mod intent;
pub mod prompt;

pub use chat_upstream::{ChatBackend, ChatMessage, ChatUpstreamError, OpenAiChatClient};
pub use config::{config_path, load_config, AppConfig};
pub use dialogue::{
    DialogueOrchestrator, DialogueRequest, OrchestrationResult, RetrievalPolicy, StreamFragment,
    TurnOutcome,
};
pub use error::{Result, XiaoxingError};
pub use events::EventSink;
pub use intent::{ConversationIntent, IntentClassifier};
pub use prompt::PromptBuilder;

const LATENCY_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];
const SERVICE_NAME: &str = "xiaoxing-core";
const DISPLAY_NAME: &str = "小星健康咨询助手";
const UPLOAD_LIMIT_BYTES: usize = 10 * 1024 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(
        health, healthz, ready, service_info,
        chat::chat_handler, chat::chat_stream_handler, chat::analyze_food_handler,
        chat::session_get_handler, chat::session_reset_handler
    ),
    components(
        schemas(
            ServiceInfo,
            chat::ChatRequest,
            chat::ChatResponse,
            chat::FoodAnalysisResponse,
            chat::FoodUpload,
            chat::SessionResponse,
            chat::SessionResetResponse,
            chat::ErrorDetail,
            dialogue::WidgetData,
            dialogue::WidgetContent,
            dialogue::VectorSearchInfo,
            dialogue::TopMatch
        )
    ),
    tags(
        (name = "core", description = "Service endpoints"),
        (name = "chat", description = "Health consultation dialogue")
    )
)]
pub struct ApiDoc;

/// Creates a latency histogram with predefined buckets.
fn create_latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS)
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

struct AppStateInner {
    config: AppConfig,
    knowledge: Arc<KnowledgeStore>,
    orchestrator: Arc<DialogueOrchestrator>,
    events: EventSink,
    knowledge_state: KnowledgeState,
    metrics_recorder: Arc<MetricsRecorder>,
    registry: Mutex<Registry>,
    ready: AtomicBool,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpDurationLabels {
    method: String,
    path: &'static str,
}

impl HttpDurationLabels {
    fn new(method: &Method, path: &'static str) -> Self {
        Self {
            method: method.as_str().to_string(),
            path,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    method: String,
    path: &'static str,
    status: String,
}

impl HttpLabels {
    fn new(method: &Method, path: &'static str, status: StatusCode) -> Self {
        Self {
            method: method.as_str().to_string(),
            path,
            status: status.as_str().to_string(),
        }
    }
}

impl AppState {
    fn new(
        config: AppConfig,
        knowledge: Arc<KnowledgeStore>,
        orchestrator: Arc<DialogueOrchestrator>,
        events: EventSink,
    ) -> Self {
        let mut registry = Registry::default();

        let build_info = Family::<BuildInfoLabels, Gauge>::default();
        build_info
            .get_or_create(&BuildInfoLabels {
                service: SERVICE_NAME,
                version: env!("CARGO_PKG_VERSION"),
            })
            .set(1);
        registry.register("build_info", "Build info per service", build_info);

        let http_requests: Family<HttpLabels, Counter<u64>> = Family::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests received",
            http_requests.clone(),
        );

        let http_latency: Family<HttpDurationLabels, Histogram> =
            Family::new_with_constructor(create_latency_histogram);
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration",
            http_latency.clone(),
        );

        let knowledge_items = Gauge::<i64>::default();
        knowledge_items.set(i64::try_from(knowledge.len()).unwrap_or(i64::MAX));
        registry.register(
            "knowledge_items",
            "Knowledge items loaded at startup",
            knowledge_items,
        );

        orchestrator.metrics().register(&mut registry);

        let metrics_recorder: Arc<MetricsRecorder> = {
            Arc::new(move |method: Method, path, status, started: Instant| {
                let counter_labels = HttpLabels::new(&method, path, status);
                let duration_labels = HttpDurationLabels::new(&method, path);
                let elapsed = started.elapsed().as_secs_f64();
                http_requests.get_or_create(&counter_labels).inc();
                http_latency
                    .get_or_create(&duration_labels)
                    .observe(elapsed);
            })
        };

        let knowledge_state = KnowledgeState::new(knowledge.clone(), metrics_recorder.clone());

        Self(Arc::new(AppStateInner {
            config,
            knowledge,
            orchestrator,
            events,
            knowledge_state,
            metrics_recorder,
            registry: Mutex::new(registry),
            ready: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.0.config
    }

    pub fn knowledge(&self) -> Arc<KnowledgeStore> {
        self.0.knowledge.clone()
    }

    pub fn orchestrator(&self) -> Arc<DialogueOrchestrator> {
        self.0.orchestrator.clone()
    }

    pub fn events(&self) -> &EventSink {
        &self.0.events
    }

    fn encode_metrics(&self) -> std::result::Result<String, fmt::Error> {
        let mut body = String::new();
        let registry = self.0.registry.lock().map_err(|_| fmt::Error)?;
        encode(&mut body, &registry)?;
        Ok(body)
    }

    pub fn record_http_observation(
        &self,
        method: Method,
        path: &'static str,
        status: StatusCode,
        started: Instant,
    ) {
        (self.0.metrics_recorder)(method, path, status, started);
    }

    pub fn set_ready(&self) {
        self.0.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.0.ready.load(Ordering::Acquire)
    }
}

impl FromRef<AppState> for KnowledgeState {
    fn from_ref(state: &AppState) -> Self {
        state.0.knowledge_state.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub status: String,
    /// First characters of the upstream API key, or `not configured`.
    pub api_key: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub knowledge_items: usize,
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service information", body = ServiceInfo)),
    tag = "core"
)]
async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    let started = Instant::now();
    let upstream = &state.config().upstream;
    let info = ServiceInfo {
        name: DISPLAY_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
        api_key: upstream.api_key_preview(),
        chat_model: upstream.chat_model.clone(),
        embedding_model: upstream.embedding_model.clone(),
        knowledge_items: state.knowledge().len(),
    };
    state.record_http_observation(Method::GET, "/", StatusCode::OK, started);
    Json(info)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service healthy")),
    tag = "core"
)]
async fn health(State(state): State<AppState>) -> &'static str {
    let started = Instant::now();
    state.record_http_observation(Method::GET, "/health", StatusCode::OK, started);
    "ok"
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service healthy")),
    tag = "core"
)]
async fn healthz(State(state): State<AppState>) -> &'static str {
    let started = Instant::now();
    state.record_http_observation(Method::GET, "/healthz", StatusCode::OK, started);
    "ok"
}

#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Service ready"),
        (status = 503, description = "Service starting")
    ),
    tag = "core"
)]
async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let started = Instant::now();
    let (status, body) = if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };
    state.record_http_observation(Method::GET, "/ready", status, started);
    (status, body)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let encoded_metrics = state.encode_metrics();
    let status = if encoded_metrics.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    state.record_http_observation(Method::GET, "/metrics", status, started);

    match encoded_metrics {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                "Internal server error".to_string(),
            )
                .into_response()
        }
    }
}

pub fn build_app(
    config: AppConfig,
    knowledge: Arc<KnowledgeStore>,
    orchestrator: Arc<DialogueOrchestrator>,
) -> Router {
    build_app_with_state(config, knowledge, orchestrator, EventSink::from_env()).0
}

pub fn build_app_with_state(
    config: AppConfig,
    knowledge: Arc<KnowledgeStore>,
    orchestrator: Arc<DialogueOrchestrator>,
    events: EventSink,
) -> (Router, AppState) {
    let cors = Arc::new(CorsPolicy::from_config(&config.server.allowed_origin));
    let timeout_ms = config.server.http_timeout_ms;
    let concurrency = config.server.http_concurrency;
    let expose_docs = config.server.expose_docs;
    let state = AppState::new(config, knowledge, orchestrator, events);

    let mut app = Router::new()
        .merge(core_routes())
        .merge(chat_routes())
        .nest("/api/knowledge", knowledge_router::<AppState>());

    if expose_docs {
        // OpenAPI UI under /docs, document under /api-docs/openapi.json
        let swagger = SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi());
        app = app.merge(swagger);
    }

    let timeout_layer = if timeout_ms > 0 {
        Some(TimeoutLayer::new(Duration::from_millis(timeout_ms)))
    } else {
        tracing::info!("http_timeout_ms=0 → request timeout disabled");
        None
    };
    let concurrency_layer = if concurrency > 0 {
        let limit = usize::try_from(concurrency).unwrap_or(usize::MAX);
        Some(ConcurrencyLimitLayer::new(limit))
    } else {
        tracing::info!("http_concurrency=0 → concurrency limit disabled");
        None
    };

    let request_guards = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|err: BoxError| async move {
            if err.is::<tower::timeout::error::Elapsed>() {
                (StatusCode::REQUEST_TIMEOUT, "request timed out")
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "service temporarily unavailable",
                )
            }
        }))
        .option_layer(timeout_layer)
        .option_layer(concurrency_layer)
        // `option_layer` yields an `Either` service; both arms need BoxError.
        .layer(tower::util::MapErrLayer::new(
            |e: std::convert::Infallible| -> BoxError { match e {} },
        ));

    // The readiness flag is set by the caller once the listener is bound.
    let app = app
        .with_state(state.clone())
        .layer(from_fn_with_state(cors, cors_middleware))
        .layer(request_guards);

    (app, state)
}

fn core_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
}

fn chat_routes() -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(chat::chat_handler))
        .route("/api/chat/stream", post(chat::chat_stream_handler))
        .route(
            "/api/analyze-food",
            post(chat::analyze_food_handler).layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES)),
        )
        .route(
            "/api/session/{id}",
            get(chat::session_get_handler).delete(chat::session_reset_handler),
        )
}

/// Which cross-origin callers receive CORS headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsPolicy {
    AnyOrigin,
    Origin(HeaderValue),
    Disabled,
}

impl CorsPolicy {
    pub fn from_config(allowed_origin: &str) -> Self {
        let trimmed = allowed_origin.trim();
        if trimmed == "*" {
            return CorsPolicy::AnyOrigin;
        }
        if trimmed.is_empty() {
            return CorsPolicy::Disabled;
        }
        match HeaderValue::from_str(trimmed) {
            Ok(value) => CorsPolicy::Origin(value),
            Err(err) => {
                tracing::warn!(origin = %trimmed, error = %err, "invalid allowed_origin, CORS disabled");
                CorsPolicy::Disabled
            }
        }
    }

    /// Value for `Access-Control-Allow-Origin`, if `origin` may call us.
    fn allow(&self, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        match (self, origin) {
            (CorsPolicy::AnyOrigin, Some(_)) => Some(HeaderValue::from_static("*")),
            (CorsPolicy::Origin(allowed), Some(origin)) if allowed == origin => {
                Some(allowed.clone())
            }
            _ => None,
        }
    }
}

async fn cors_middleware(
    State(policy): State<Arc<CorsPolicy>>,
    req: Request<Body>,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let allow_origin = policy.allow(req.headers().get(header::ORIGIN));

    if req.method() == Method::OPTIONS {
        let Some(allow_origin) = allow_origin else {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::empty())
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
        };

        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin)
            .header(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, HEAD, POST, DELETE, OPTIONS",
            )
            .header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            )
            .header(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("600"),
            )
            .header(header::VARY, HeaderValue::from_static("Origin"))
            .body(Body::empty())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    let mut response = next.run(req).await;
    if let Some(allow_origin) = allow_origin {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        response
            .headers_mut()
            .append(header::VARY, HeaderValue::from_static("Origin"));
    }

    Ok(response)
}
