use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "./config/xiaoxing.yaml";

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_allowed_origin() -> String {
    "*".to_string()
}

const fn default_http_timeout_ms() -> u64 {
    120_000
}

const fn default_http_concurrency() -> u64 {
    64
}

fn default_base_url() -> String {
    "https://api-inference.modelscope.cn/v1".to_string()
}

fn default_chat_model() -> String {
    "Qwen/Qwen3-VL-235B-A22B-Instruct".to_string()
}

fn default_embedding_model() -> String {
    "Qwen/Qwen3-Embedding-8B".to_string()
}

const fn default_embedding_dimensions() -> usize {
    xiaoxing_embeddings::DEFAULT_DIMENSIONS
}

const fn default_similarity_threshold() -> f32 {
    0.40
}

const fn default_top_k() -> usize {
    3
}

const fn default_preview_chars() -> usize {
    100
}

const fn default_max_sessions() -> usize {
    10_000
}

fn default_knowledge_base() -> PathBuf {
    PathBuf::from("./knowledge_base")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// `"*"` allows any origin.
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
    /// Zero disables the request timeout.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Zero disables the concurrency limit.
    #[serde(default = "default_http_concurrency")]
    pub http_concurrency: u64,
    #[serde(default)]
    pub expose_docs: bool,
    /// Dialogue states kept before the least recent session is evicted.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
    /// Only ever taken from the environment; a value in the file is
    /// accepted and discarded by [`load_config`].
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_base")]
    pub base_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origin: default_allowed_origin(),
            http_timeout_ms: default_http_timeout_ms(),
            http_concurrency: default_http_concurrency(),
            expose_docs: false,
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            api_key: None,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
            preview_chars: default_preview_chars(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            base_path: default_knowledge_base(),
        }
    }
}

impl UpstreamConfig {
    /// First eight characters of the key followed by `...`, for the info route.
    pub fn api_key_preview(&self) -> String {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => {
                let head: String = key.chars().take(8).collect();
                format!("{head}...")
            }
            _ => "not configured".to_string(),
        }
    }
}

impl AppConfig {
    /// Applies `XIAOXING_*` overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.upstream.api_key = non_empty_env("XIAOXING_API_KEY")
            .or_else(|| non_empty_env("MODELSCOPE_API_KEY"))
            .or(self.upstream.api_key.take());

        if let Some(url) = non_empty_env("XIAOXING_UPSTREAM_URL") {
            self.upstream.base_url = url;
        }
        if let Some(model) = non_empty_env("XIAOXING_CHAT_MODEL") {
            self.upstream.chat_model = model;
        }
        if let Some(model) = non_empty_env("XIAOXING_EMBEDDING_MODEL") {
            self.upstream.embedding_model = model;
        }
        if let Some(dir) = non_empty_env("XIAOXING_KNOWLEDGE_DIR") {
            self.knowledge.base_path = PathBuf::from(dir);
        }
        if let Some(bind) = non_empty_env("XIAOXING_BIND") {
            self.server.bind = bind;
        }
        if let Some(ms) = env_u64("XIAOXING_HTTP_TIMEOUT_MS") {
            self.server.http_timeout_ms = ms;
        }
        if let Some(limit) = env_u64("XIAOXING_HTTP_CONCURRENCY") {
            self.server.http_concurrency = limit;
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = non_empty_env(key)?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, value = %raw, error = %err, "ignoring invalid numeric override");
            None
        }
    }
}

/// Path of the config file, honouring `XIAOXING_CONFIG`.
pub fn config_path() -> PathBuf {
    non_empty_env("XIAOXING_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Reads the YAML config. A missing or malformed file is logged and the
/// defaults are used instead.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<AppConfig> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml_ng::from_str::<AppConfig>(&content) {
            Ok(mut config) => {
                if config.upstream.api_key.take().is_some() {
                    tracing::warn!(
                        path = %path.display(),
                        "ignoring upstream.api_key from config file; set XIAOXING_API_KEY instead"
                    );
                }
                Ok(config)
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse config YAML, falling back to defaults"
                );
                Ok(AppConfig::default())
            }
        },
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config YAML, falling back to defaults"
            );
            Ok(AppConfig::default())
        }
    }
}
