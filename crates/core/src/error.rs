use std::io;
use thiserror::Error;
use xiaoxing_embeddings::EmbedError;
use xiaoxing_knowledge::KnowledgeLoadError;

use crate::chat_upstream::ChatUpstreamError;

pub type Result<T> = std::result::Result<T, XiaoxingError>;

#[derive(Debug, Error)]
pub enum XiaoxingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Embedding upstream error: {0}")]
    UpstreamEmbedding(#[from] EmbedError),

    #[error("Chat upstream error: {0}")]
    UpstreamLlm(#[from] ChatUpstreamError),

    #[error("Knowledge load error: {0}")]
    KnowledgeLoad(#[from] KnowledgeLoadError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl XiaoxingError {
    /// Stable label for logs and the `upstream_failures` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            XiaoxingError::Validation(_) => "validation",
            XiaoxingError::UpstreamEmbedding(_) => "upstream_embedding",
            XiaoxingError::UpstreamLlm(_) => "upstream_llm",
            XiaoxingError::KnowledgeLoad(_) => "knowledge_load",
            XiaoxingError::Config(_) => "config",
            XiaoxingError::Io(_) => "io",
            XiaoxingError::Json(_) => "json",
        }
    }
}
