use anyhow::Context;
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;
use xiaoxing_core::{
    build_app_with_state, config_path, load_config, DialogueOrchestrator, EventSink,
    OpenAiChatClient, RetrievalPolicy,
};
use xiaoxing_embeddings::OpenAiEmbedder;
use xiaoxing_knowledge::KnowledgeStore;

const LOG_DIR_ENV: &str = "XIAOXING_LOG_DIR";
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match env::var(LOG_DIR_ENV).ok().filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "xiaoxing.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let path = config_path();
    let mut config = load_config(&path)?;
    config.apply_env();

    if config.upstream.api_key.is_none() {
        tracing::warn!("no upstream API key configured; model calls will be rejected");
    }

    let knowledge = Arc::new(KnowledgeStore::load(&config.knowledge.base_path));
    let stats = knowledge.stats();
    tracing::info!(
        base = %config.knowledge.base_path.display(),
        total = stats.total,
        categories = ?stats.categories,
        "knowledge base loaded"
    );

    let base_url = Url::parse(&config.upstream.base_url)
        .with_context(|| format!("invalid upstream base_url '{}'", config.upstream.base_url))?;
    let http = reqwest::Client::builder()
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .build()
        .context("failed to build upstream HTTP client")?;

    let embedder = OpenAiEmbedder::new(
        http.clone(),
        base_url.clone(),
        config.upstream.embedding_model.clone(),
    )
    .with_api_key(config.upstream.api_key.clone())
    .with_dimensions(config.upstream.embedding_dimensions);
    let chat = OpenAiChatClient::new(http, base_url, config.upstream.chat_model.clone())
        .with_api_key(config.upstream.api_key.clone());

    let orchestrator = Arc::new(DialogueOrchestrator::new(
        Arc::new(embedder),
        Arc::new(chat),
        RetrievalPolicy::from(&config.retrieval),
    )
    .with_session_limit(config.server.max_sessions));

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    tracing::info!(
        config = %path.display(),
        api_key = %config.upstream.api_key_preview(),
        chat_model = %config.upstream.chat_model,
        embedding_model = %config.upstream.embedding_model,
        "starting xiaoxing"
    );

    let (app, state) =
        build_app_with_state(config, knowledge, orchestrator, EventSink::from_env());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    state.set_ready();
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
