use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, stream::BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ChatUpstreamError {
    #[error("chat request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("chat stream interrupted: {0}")]
    Stream(String),

    #[error("failed to decode chat chunk: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("chat upstream returned no content")]
    EmptyResponse,
}

/// Text deltas of a streamed completion, in arrival order.
pub type DeltaStream = BoxStream<'static, Result<String, ChatUpstreamError>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// A single user turn: the text part, then the image part when present.
pub fn user_message(text: &str, image_url: Option<&str>) -> ChatMessage {
    let mut content = vec![ContentPart::Text {
        text: text.to_string(),
    }];
    if let Some(url) = image_url {
        content.push(ContentPart::ImageUrl {
            image_url: ImageRef {
                url: url.to_string(),
            },
        });
    }
    ChatMessage {
        role: "user".to_string(),
        content,
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One-shot completion; returns the first choice's message text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatUpstreamError>;

    /// Streamed completion; yields only non-empty text deltas.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<DeltaStream, ChatUpstreamError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl StreamChunk {
    fn into_text(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|text| !text.is_empty())
    }
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: Client,
    base_url: Url,
    model: String,
    api_key: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(client: Client, base_url: Url, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url,
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, ChatUpstreamError> {
        let url = format!(
            "{}/chat/completions",
            self.base_url.as_str().trim_end_matches('/')
        );
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            stream,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%url, status = status.as_u16(), "chat upstream rejected request");
            return Err(ChatUpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatUpstreamError> {
        let response = self.send(messages, false).await?;
        let parsed: ChatCompletionResponse = response.json().await?;
        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ChatUpstreamError::EmptyResponse)?;

        tracing::debug!(model = %self.model, chars = reply.chars().count(), "chat completion received");
        Ok(reply)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<DeltaStream, ChatUpstreamError> {
        let response = self.send(messages, true).await?;
        tracing::debug!(model = %self.model, "chat stream opened");

        let deltas = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
                future::ready(!done)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => match serde_json::from_str::<StreamChunk>(&event.data) {
                        Ok(chunk) => chunk.into_text().map(Ok),
                        Err(err) => Some(Err(ChatUpstreamError::Decode(err))),
                    },
                    Err(err) => Some(Err(ChatUpstreamError::Stream(err.to_string()))),
                }
            });

        Ok(Box::pin(deltas))
    }
}
