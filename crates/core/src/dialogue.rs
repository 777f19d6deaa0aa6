//! Per-turn pipeline: classify, retrieve, gate, prompt, call the model,
//! post-process and record the session turn.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use futures::{stream, Stream, StreamExt};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::ToSchema;
use xiaoxing_embeddings::{CacheStats, CachedEmbedder, Embedder, SharedEmbedding};
use xiaoxing_knowledge::{rank, top_k, KnowledgeItem, KnowledgeStore, ScoredMatch};

use crate::{
    chat_upstream::{user_message, ChatBackend, DeltaStream},
    config::RetrievalConfig,
    error::{Result, XiaoxingError},
    intent::{ConversationIntent, IntentClassifier},
    prompt::PromptBuilder,
};

pub const APOLOGY_MESSAGE: &str = "抱歉，处理您的请求时出现了错误。请稍后再试。";
pub const EMPTY_MESSAGE: &str = "消息内容不能为空";
pub const WIDGET_MARKERS: [&str; 2] = ["[卡片]", "[展示]"];
pub const WIDGET_TITLE: &str = "健康建议";
pub const DEFAULT_SESSION: &str = "default";
/// Longer client session ids are truncated to this many characters.
pub const MAX_SESSION_ID_CHARS: usize = 128;
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;
const ERROR_INTENT: &str = "error";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DialogueRequest {
    pub user_input: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl DialogueRequest {
    pub fn new(user_input: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn session_key(&self) -> &str {
        let id = self
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_SESSION);
        match id.char_indices().nth(MAX_SESSION_ID_CHARS) {
            Some((end, _)) => &id[..end],
            None => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct WidgetContent {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct WidgetData {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: WidgetContent,
}

/// Builds a picture widget when the reply carries a display marker.
pub fn extract_widget(response: &str) -> Option<WidgetData> {
    if !WIDGET_MARKERS.iter().any(|marker| response.contains(marker)) {
        return None;
    }
    Some(WidgetData {
        kind: "widget_pic".to_string(),
        content: WidgetContent {
            title: WIDGET_TITLE.to_string(),
            content: response.to_string(),
        },
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TopMatch {
    pub content: String,
    pub category: String,
    pub score: f64,
}

/// Retrieval diagnostic returned to clients when the gate admits documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VectorSearchInfo {
    pub enabled: bool,
    pub total_knowledge: usize,
    pub retrieved_count: usize,
    pub top_matches: Vec<TopMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationResult {
    pub text_response: String,
    pub widget_data: Option<WidgetData>,
    pub intent: String,
    pub vector_search: Option<VectorSearchInfo>,
}

impl OrchestrationResult {
    pub fn apology() -> Self {
        Self {
            text_response: APOLOGY_MESSAGE.to_string(),
            widget_data: None,
            intent: ERROR_INTENT.to_string(),
            vector_search: None,
        }
    }
}

/// Result of a batch turn. Degraded turns still carry a well-formed payload.
#[derive(Debug)]
pub enum TurnOutcome {
    Answered(OrchestrationResult),
    Degraded {
        result: OrchestrationResult,
        cause: XiaoxingError,
    },
}

impl TurnOutcome {
    pub fn result(&self) -> &OrchestrationResult {
        match self {
            TurnOutcome::Answered(result) => result,
            TurnOutcome::Degraded { result, .. } => result,
        }
    }

    pub fn into_result(self) -> OrchestrationResult {
        match self {
            TurnOutcome::Answered(result) => result,
            TurnOutcome::Degraded { result, .. } => result,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, TurnOutcome::Degraded { .. })
    }
}

/// One unit of a streamed turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFragment {
    Delta {
        content: String,
    },
    Complete {
        intent: String,
        widget_data: Option<WidgetData>,
        vector_search: Option<VectorSearchInfo>,
    },
    Error {
        error: String,
    },
    Done,
}

impl StreamFragment {
    /// Payload for an SSE `data:` line; the terminator is the bare `[DONE]`.
    pub fn to_data(&self) -> String {
        match self {
            StreamFragment::Done => "[DONE]".to_string(),
            fragment => serde_json::to_string(fragment).unwrap_or_else(|err| {
                tracing::error!(error = %err, "failed to encode stream fragment");
                r#"{"type":"error","error":"encoding failure"}"#.to_string()
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accepted,
    Suppressed,
    NoKnowledge,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::Accepted => "accepted",
            GateDecision::Suppressed => "suppressed",
            GateDecision::NoKnowledge => "no_knowledge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Retrieval {
    pub decision: GateDecision,
    pub max_score: f32,
    pub docs: Vec<String>,
    pub vector_search: Option<VectorSearchInfo>,
}

impl Retrieval {
    fn without_knowledge() -> Self {
        Self {
            decision: GateDecision::NoKnowledge,
            max_score: 0.0,
            docs: Vec::new(),
            vector_search: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalPolicy {
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub preview_chars: usize,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for RetrievalPolicy {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            top_k: config.top_k,
            preview_chars: config.preview_chars,
        }
    }
}

impl RetrievalPolicy {
    /// Applies the threshold gate to already ranked, truncated matches.
    ///
    /// The gate is inclusive: a best score equal to the threshold admits
    /// every match.
    pub fn admit(&self, total_knowledge: usize, matches: &[ScoredMatch<&KnowledgeItem>]) -> Retrieval {
        let max_score = matches
            .iter()
            .map(|m| m.score)
            .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))))
            .unwrap_or(0.0);

        if max_score < self.similarity_threshold {
            return Retrieval {
                decision: GateDecision::Suppressed,
                max_score,
                docs: Vec::new(),
                vector_search: None,
            };
        }

        let docs = matches.iter().map(|m| m.item.content.clone()).collect();
        let top_matches = matches
            .iter()
            .map(|m| TopMatch {
                content: self.preview(&m.item.content),
                category: m.item.category_label().to_string(),
                score: round4(m.score),
            })
            .collect();

        Retrieval {
            decision: GateDecision::Accepted,
            max_score,
            docs,
            vector_search: Some(VectorSearchInfo {
                enabled: true,
                total_knowledge,
                retrieved_count: matches.len(),
                top_matches,
            }),
        }
    }

    fn preview(&self, content: &str) -> String {
        if content.chars().count() <= self.preview_chars {
            return content.to_string();
        }
        let mut head: String = content.chars().take(self.preview_chars).collect();
        head.push_str("...");
        head
    }
}

fn round4(score: f32) -> f64 {
    (f64::from(score) * 10_000.0).round() / 10_000.0
}

/// Conversation memory for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DialogueState {
    pub last_intent: Option<ConversationIntent>,
    pub turn_count: u64,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub user_profile: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug)]
struct SessionEntry {
    state: DialogueState,
    last_turn: u64,
}

#[derive(Debug, Default)]
struct SessionMap {
    entries: HashMap<String, SessionEntry>,
    clock: u64,
}

impl SessionMap {
    /// Drops the session whose last recorded turn is the oldest.
    fn evict_least_recent(&mut self) -> Option<String> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_turn)
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&oldest);
        Some(oldest)
    }
}

/// Per-session dialogue state, capped at `capacity` sessions.
///
/// Recording a turn for a new session when the map is full evicts the
/// session with the least recent turn. Reads do not refresh recency.
#[derive(Debug)]
pub struct SessionStates {
    inner: RwLock<SessionMap>,
    capacity: usize,
}

impl Default for SessionStates {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStates {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(SessionMap::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records a completed turn and returns the session's new turn count.
    pub async fn record_turn(&self, session_id: &str, intent: ConversationIntent) -> u64 {
        let mut sessions = self.inner.write().await;
        sessions.clock += 1;
        let now = sessions.clock;

        if !sessions.entries.contains_key(session_id) && sessions.entries.len() >= self.capacity {
            if let Some(evicted) = sessions.evict_least_recent() {
                tracing::debug!(session_id = %evicted, "evicted least recent dialogue state");
            }
        }

        let entry = sessions
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                state: DialogueState::default(),
                last_turn: now,
            });
        entry.last_turn = now;
        entry.state.last_intent = Some(intent);
        entry.state.turn_count += 1;
        entry.state.turn_count
    }

    pub async fn get(&self, session_id: &str) -> Option<DialogueState> {
        self.inner
            .read()
            .await
            .entries
            .get(session_id)
            .map(|entry| entry.state.clone())
    }

    /// Drops the session; returns whether it existed.
    pub async fn reset(&self, session_id: &str) -> bool {
        let removed = self
            .inner
            .write()
            .await
            .entries
            .remove(session_id)
            .is_some();
        if removed {
            tracing::info!(session_id, "dialogue state reset");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TurnLabels {
    intent: &'static str,
    outcome: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    decision: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    kind: &'static str,
}

#[derive(Clone, Default)]
pub struct DialogueMetrics {
    turns: Family<TurnLabels, Counter<u64>>,
    gate: Family<DecisionLabels, Counter<u64>>,
    upstream_failures: Family<FailureLabels, Counter<u64>>,
}

impl DialogueMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "dialogue_turns",
            "Dialogue turns by intent and outcome",
            self.turns.clone(),
        );
        registry.register(
            "retrieval_gate",
            "Similarity gate decisions",
            self.gate.clone(),
        );
        registry.register(
            "upstream_failures",
            "Failed calls to the embedding or chat upstream",
            self.upstream_failures.clone(),
        );
    }

    fn turn(&self, intent: &'static str, outcome: &'static str) {
        self.turns
            .get_or_create(&TurnLabels { intent, outcome })
            .inc();
    }

    fn gate(&self, decision: GateDecision) {
        self.gate
            .get_or_create(&DecisionLabels {
                decision: decision.as_str(),
            })
            .inc();
    }

    fn upstream_failure(&self, kind: &'static str) {
        self.upstream_failures
            .get_or_create(&FailureLabels { kind })
            .inc();
    }

    pub fn turn_count(&self, intent: &'static str, outcome: &'static str) -> u64 {
        self.turns.get_or_create(&TurnLabels { intent, outcome }).get()
    }

    pub fn gate_count(&self, decision: GateDecision) -> u64 {
        self.gate
            .get_or_create(&DecisionLabels {
                decision: decision.as_str(),
            })
            .get()
    }

    pub fn failure_count(&self, kind: &'static str) -> u64 {
        self.upstream_failures
            .get_or_create(&FailureLabels { kind })
            .get()
    }
}

/// Rejects input that is empty after trimming.
pub fn validate_input(user_input: &str) -> Result<()> {
    if user_input.trim().is_empty() {
        return Err(XiaoxingError::Validation(EMPTY_MESSAGE.to_string()));
    }
    Ok(())
}

pub struct DialogueOrchestrator {
    classifier: IntentClassifier,
    embedder: CachedEmbedder,
    llm: Arc<dyn ChatBackend>,
    prompts: PromptBuilder,
    policy: RetrievalPolicy,
    sessions: SessionStates,
    metrics: DialogueMetrics,
}

impl DialogueOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn ChatBackend>,
        policy: RetrievalPolicy,
    ) -> Self {
        Self {
            classifier: IntentClassifier::default(),
            embedder: CachedEmbedder::new(embedder),
            llm,
            prompts: PromptBuilder,
            policy,
            sessions: SessionStates::default(),
            metrics: DialogueMetrics::default(),
        }
    }

    /// Caps the number of sessions whose dialogue state is kept.
    pub fn with_session_limit(mut self, max_sessions: usize) -> Self {
        self.sessions = SessionStates::with_capacity(max_sessions);
        self
    }

    pub fn metrics(&self) -> &DialogueMetrics {
        &self.metrics
    }

    pub fn sessions(&self) -> &SessionStates {
        &self.sessions
    }

    pub fn policy(&self) -> RetrievalPolicy {
        self.policy
    }

    pub fn embedding_stats(&self) -> CacheStats {
        self.embedder.stats()
    }

    /// Runs one batch turn.
    ///
    /// Only invalid input is an `Err`; upstream failures become
    /// [`TurnOutcome::Degraded`].
    pub async fn process(
        &self,
        request: &DialogueRequest,
        knowledge: &[KnowledgeItem],
    ) -> Result<TurnOutcome> {
        validate_input(&request.user_input)?;
        let session = request.session_key();

        match self.run_turn(request, knowledge).await {
            Ok((intent, result)) => {
                let turns = self.sessions.record_turn(session, intent).await;
                self.metrics.turn(intent.as_str(), "answered");
                tracing::info!(
                    session,
                    intent = %intent,
                    turns,
                    widget = result.widget_data.is_some(),
                    "dialogue turn answered"
                );
                Ok(TurnOutcome::Answered(result))
            }
            Err(cause) => {
                self.metrics.upstream_failure(cause.kind());
                self.metrics.turn(ERROR_INTENT, "degraded");
                tracing::error!(session, error = %cause, kind = cause.kind(), "dialogue turn failed");
                Ok(TurnOutcome::Degraded {
                    result: OrchestrationResult::apology(),
                    cause,
                })
            }
        }
    }

    /// Runs one streamed turn.
    ///
    /// Input is validated before the stream is created. The stream yields a
    /// `Delta` per upstream text delta, then `Complete` or `Error`, and always
    /// ends with `Done`. Nothing runs until it is polled; dropping it drops the
    /// upstream response.
    pub fn process_stream(
        self: Arc<Self>,
        request: DialogueRequest,
        knowledge: Arc<KnowledgeStore>,
    ) -> Result<impl Stream<Item = StreamFragment> + Send + 'static> {
        validate_input(&request.user_input)?;

        let start = StreamStage::Pending {
            orchestrator: self,
            request,
            knowledge,
        };
        Ok(stream::unfold(start, StreamStage::advance))
    }

    /// Classifies, retrieves and opens the upstream stream for a streamed turn.
    async fn open_stream(
        self: Arc<Self>,
        request: DialogueRequest,
        knowledge: Arc<KnowledgeStore>,
    ) -> StreamStage {
        let intent = self.classifier.classify(&request.user_input).intent;
        let retrieval = self.retrieve(&request.user_input, knowledge.items()).await;
        let image_url = request.image_url.as_deref();
        let prompt = self.prompts.build(
            &request.user_input,
            &retrieval.docs,
            intent,
            image_url.is_some(),
        );
        let messages = [user_message(&prompt, image_url)];
        let opened = self.llm.stream(&messages).await;

        let turn = StreamTurn {
            orchestrator: self,
            session: request.session_key().to_string(),
            intent,
            vector_search: retrieval.vector_search,
            text: String::new(),
        };
        match opened {
            Ok(deltas) => StreamStage::Relaying { turn, deltas },
            Err(err) => StreamStage::Failed(turn.fail(err.into())),
        }
    }

    async fn run_turn(
        &self,
        request: &DialogueRequest,
        knowledge: &[KnowledgeItem],
    ) -> Result<(ConversationIntent, OrchestrationResult)> {
        let matched = self.classifier.classify(&request.user_input);
        let intent = matched.intent;
        tracing::debug!(intent = %intent, keyword = ?matched.keyword, "intent classified");

        let retrieval = self.retrieve(&request.user_input, knowledge).await;
        let image_url = request.image_url.as_deref();
        let prompt = self
            .prompts
            .build(&request.user_input, &retrieval.docs, intent, image_url.is_some());
        let messages = [user_message(&prompt, image_url)];

        let text_response = match image_url {
            // Multimodal replies only come through the streaming path.
            Some(_) => {
                let mut deltas = self.llm.stream(&messages).await?;
                let mut text = String::new();
                while let Some(delta) = deltas.next().await {
                    text.push_str(&delta?);
                }
                text
            }
            None => self.llm.complete(&messages).await?,
        };

        let result = OrchestrationResult {
            widget_data: extract_widget(&text_response),
            text_response,
            intent: intent.as_str().to_string(),
            vector_search: retrieval.vector_search,
        };
        Ok((intent, result))
    }

    async fn retrieve(&self, user_input: &str, knowledge: &[KnowledgeItem]) -> Retrieval {
        if knowledge.is_empty() {
            self.metrics.gate(GateDecision::NoKnowledge);
            return Retrieval::without_knowledge();
        }

        let query = self.embed_or_zero(user_input).await;
        let mut candidates: Vec<(&KnowledgeItem, SharedEmbedding)> =
            Vec::with_capacity(knowledge.len());
        for item in knowledge {
            candidates.push((item, self.embed_or_zero(&item.content).await));
        }

        let matches = top_k(rank(&query, candidates), self.policy.top_k);
        let retrieval = self.policy.admit(knowledge.len(), &matches);
        self.metrics.gate(retrieval.decision);

        match retrieval.decision {
            GateDecision::Accepted => tracing::info!(
                retrieved = retrieval.docs.len(),
                max_score = retrieval.max_score,
                "retrieval accepted"
            ),
            _ => tracing::info!(
                max_score = retrieval.max_score,
                threshold = self.policy.similarity_threshold,
                "retrieval suppressed below threshold"
            ),
        }
        retrieval
    }

    async fn embed_or_zero(&self, text: &str) -> SharedEmbedding {
        match self.embedder.embed(text).await {
            Ok(vector) => vector,
            Err(err) => {
                let err = XiaoxingError::from(err);
                self.metrics.upstream_failure(err.kind());
                tracing::warn!(error = %err, "embedding failed, using zero vector");
                self.embedder.zero_vector()
            }
        }
    }
}

/// Progress of a streamed turn, advanced by `stream::unfold`.
enum StreamStage {
    Pending {
        orchestrator: Arc<DialogueOrchestrator>,
        request: DialogueRequest,
        knowledge: Arc<KnowledgeStore>,
    },
    Relaying {
        turn: StreamTurn,
        deltas: DeltaStream,
    },
    Failed(StreamFragment),
    Finished,
    Closed,
}

struct StreamTurn {
    orchestrator: Arc<DialogueOrchestrator>,
    session: String,
    intent: ConversationIntent,
    vector_search: Option<VectorSearchInfo>,
    text: String,
}

impl StreamTurn {
    fn fail(&self, cause: XiaoxingError) -> StreamFragment {
        let metrics = &self.orchestrator.metrics;
        metrics.upstream_failure(cause.kind());
        metrics.turn(ERROR_INTENT, "degraded");
        tracing::error!(
            session = %self.session,
            error = %cause,
            kind = cause.kind(),
            "dialogue stream failed"
        );
        StreamFragment::Error {
            error: cause.to_string(),
        }
    }

    async fn complete(self) -> StreamFragment {
        let orchestrator = &self.orchestrator;
        let turns = orchestrator
            .sessions
            .record_turn(&self.session, self.intent)
            .await;
        orchestrator.metrics.turn(self.intent.as_str(), "answered");
        tracing::info!(
            session = %self.session,
            intent = %self.intent,
            turns,
            "dialogue stream completed"
        );
        StreamFragment::Complete {
            intent: self.intent.as_str().to_string(),
            widget_data: extract_widget(&self.text),
            vector_search: self.vector_search,
        }
    }
}

impl StreamStage {
    async fn advance(self) -> Option<(StreamFragment, StreamStage)> {
        let mut stage = self;
        loop {
            stage = match stage {
                StreamStage::Pending {
                    orchestrator,
                    request,
                    knowledge,
                } => orchestrator.open_stream(request, knowledge).await,
                StreamStage::Relaying {
                    mut turn,
                    mut deltas,
                } => {
                    return match deltas.next().await {
                        Some(Ok(content)) => {
                            turn.text.push_str(&content);
                            Some((
                                StreamFragment::Delta { content },
                                StreamStage::Relaying { turn, deltas },
                            ))
                        }
                        Some(Err(err)) => Some((turn.fail(err.into()), StreamStage::Finished)),
                        None => Some((turn.complete().await, StreamStage::Finished)),
                    };
                }
                StreamStage::Failed(fragment) => return Some((fragment, StreamStage::Finished)),
                StreamStage::Finished => return Some((StreamFragment::Done, StreamStage::Closed)),
                StreamStage::Closed => return None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_upstream::{ChatMessage, ChatUpstreamError, ContentPart, DeltaStream, ImageRef};
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use xiaoxing_embeddings::EmbedError;
    use xiaoxing_knowledge::KnowledgeCategory;

    struct FixedEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        fallback: Vec<f32>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedEmbedder {
        fn new(vectors: &[(&str, Vec<f32>)], fallback: Vec<f32>) -> Self {
            Self {
                vectors: vectors
                    .iter()
                    .map(|(text, v)| (text.to_string(), v.clone()))
                    .collect(),
                fallback,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(dims: usize) -> Self {
            Self {
                fail: true,
                ..Self::new(&[], vec![0.0; dims])
            }
        }
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmbedError::Empty);
            }
            Ok(self
                .vectors
                .get(text)
                .cloned()
                .unwrap_or_else(|| self.fallback.clone()))
        }

        fn dimensions(&self) -> usize {
            self.fallback.len()
        }

        fn model(&self) -> &str {
            "fixed"
        }
    }

    #[derive(Default)]
    struct ScriptedChat {
        reply: Option<String>,
        chunks: Vec<std::result::Result<String, String>>,
        refuse_stream: bool,
        calls: AtomicUsize,
        prompts: Mutex<Vec<ChatMessage>>,
    }

    impl ScriptedChat {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                ..Self::default()
            }
        }

        fn streaming(chunks: Vec<std::result::Result<&str, &str>>) -> Self {
            Self {
                chunks: chunks
                    .into_iter()
                    .map(|c| c.map(str::to_string).map_err(str::to_string))
                    .collect(),
                ..Self::default()
            }
        }

        fn refusing_stream() -> Self {
            Self {
                refuse_stream: true,
                ..Self::default()
            }
        }

        fn last_prompt(&self) -> String {
            let prompts = self.prompts.lock().unwrap();
            match prompts.last().map(|m| m.content[0].clone()) {
                Some(ContentPart::Text { text }) => text,
                other => panic!("unexpected content {other:?}"),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedChat {
        async fn complete(
            &self,
            messages: &[ChatMessage],
        ) -> std::result::Result<String, ChatUpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().extend(messages.iter().cloned());
            self.reply.clone().ok_or(ChatUpstreamError::EmptyResponse)
        }

        async fn stream(
            &self,
            messages: &[ChatMessage],
        ) -> std::result::Result<DeltaStream, ChatUpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().extend(messages.iter().cloned());
            if self.refuse_stream {
                return Err(ChatUpstreamError::Status {
                    status: 503,
                    body: "busy".into(),
                });
            }
            let items: Vec<_> = self
                .chunks
                .iter()
                .cloned()
                .map(|c| c.map_err(ChatUpstreamError::Stream))
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn nutrition_item() -> KnowledgeItem {
        KnowledgeItem::new("每天保证摄入300-500克蔬菜", KnowledgeCategory::Nutrition)
    }

    fn orchestrator(embedder: FixedEmbedder, chat: Arc<ScriptedChat>) -> DialogueOrchestrator {
        DialogueOrchestrator::new(Arc::new(embedder), chat, RetrievalPolicy::default())
    }

    fn scored(item: &KnowledgeItem, score: f32) -> ScoredMatch<&KnowledgeItem> {
        ScoredMatch { item, score }
    }

    #[test]
    fn gate_suppresses_below_threshold() {
        let item = nutrition_item();
        let retrieval = RetrievalPolicy::default().admit(1, &[scored(&item, 0.39)]);
        assert_eq!(retrieval.decision, GateDecision::Suppressed);
        assert!(retrieval.docs.is_empty());
        assert!(retrieval.vector_search.is_none());
    }

    #[test]
    fn gate_admits_exact_threshold() {
        let item = nutrition_item();
        let retrieval = RetrievalPolicy::default().admit(5, &[scored(&item, 0.40)]);
        assert_eq!(retrieval.decision, GateDecision::Accepted);
        let info = retrieval.vector_search.unwrap();
        assert!(info.enabled);
        assert_eq!(info.total_knowledge, 5);
        assert_eq!(info.retrieved_count, 1);
        assert_eq!(info.top_matches[0].score, 0.4);
    }

    #[test]
    fn gate_with_no_matches_is_suppressed() {
        let retrieval = RetrievalPolicy::default().admit(0, &[]);
        assert_eq!(retrieval.decision, GateDecision::Suppressed);
        assert_eq!(retrieval.max_score, 0.0);
    }

    #[test]
    fn previews_truncate_long_content_by_chars() {
        let long = "蔬".repeat(120);
        let item = KnowledgeItem::new(long, KnowledgeCategory::Nutrition);
        let untagged = KnowledgeItem {
            category: None,
            ..KnowledgeItem::new("短", KnowledgeCategory::General)
        };
        let retrieval =
            RetrievalPolicy::default().admit(2, &[scored(&item, 0.8), scored(&untagged, 0.5)]);
        let matches = retrieval.vector_search.unwrap().top_matches;

        assert_eq!(matches[0].content.chars().count(), 103);
        assert!(matches[0].content.ends_with("..."));
        assert_eq!(matches[1].content, "短");
        assert_eq!(matches[1].category, "unknown");
    }

    #[test]
    fn scores_round_to_four_decimals() {
        assert_eq!(round4(0.123_456), 0.1235);
        assert_eq!(round4(0.9), 0.9);
    }

    #[test]
    fn widget_markers_produce_picture_widget() {
        let widget = extract_widget("推荐如下 [展示] 早餐").unwrap();
        assert_eq!(widget.kind, "widget_pic");
        assert_eq!(widget.content.title, "健康建议");
        assert_eq!(widget.content.content, "推荐如下 [展示] 早餐");
        assert!(extract_widget("[卡片]").is_some());
        assert!(extract_widget("普通回答").is_none());

        let json = serde_json::to_value(&widget).unwrap();
        assert_eq!(json["type"], "widget_pic");
    }

    #[test]
    fn stream_fragments_encode_as_tagged_json() {
        let delta = StreamFragment::Delta {
            content: "多".into(),
        };
        assert_eq!(delta.to_data(), r#"{"type":"delta","content":"多"}"#);
        assert_eq!(StreamFragment::Done.to_data(), "[DONE]");
    }

    #[tokio::test]
    async fn relevant_knowledge_is_retrieved_end_to_end() {
        let item = nutrition_item();
        let embedder = FixedEmbedder::new(
            &[
                ("我该怎么吃", vec![1.0, 0.0]),
                (item.content.as_str(), vec![0.9, 0.43589]),
            ],
            vec![0.0, 1.0],
        );
        let chat = Arc::new(ScriptedChat::replying("多吃蔬菜"));
        let orchestrator = orchestrator(embedder, chat.clone());

        let outcome = orchestrator
            .process(&DialogueRequest::new("我该怎么吃"), &[item.clone()])
            .await
            .unwrap();
        assert!(!outcome.is_degraded());

        let result = outcome.into_result();
        assert_eq!(result.text_response, "多吃蔬菜");
        assert_eq!(result.intent, "nutrition");
        assert!(result.widget_data.is_none());
        let info = result.vector_search.unwrap();
        assert_eq!(info.retrieved_count, 1);
        assert_eq!(info.top_matches[0].category, "nutrition");
        assert!((info.top_matches[0].score - 0.9).abs() < 1e-3);

        assert!(chat.last_prompt().contains(&item.content));
        assert_eq!(
            orchestrator.metrics().gate_count(GateDecision::Accepted),
            1
        );
    }

    #[tokio::test]
    async fn knowledge_embeddings_are_cached_across_turns() {
        let item = nutrition_item();
        let embedder = Arc::new(FixedEmbedder::new(&[], vec![1.0, 0.0]));
        let chat = Arc::new(ScriptedChat::replying("ok"));
        let orchestrator =
            DialogueOrchestrator::new(embedder.clone(), chat, RetrievalPolicy::default());

        for _ in 0..2 {
            orchestrator
                .process(&DialogueRequest::new("喝水"), &[item.clone()])
                .await
                .unwrap();
        }
        // One call for the query and one for the item; the second turn is all hits.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.embedding_stats().hits, 2);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_apology() {
        let chat = Arc::new(ScriptedChat::default());
        let orchestrator = orchestrator(FixedEmbedder::new(&[], vec![1.0]), chat);

        let outcome = orchestrator
            .process(&DialogueRequest::new("最近失眠"), &[])
            .await
            .unwrap();
        match &outcome {
            TurnOutcome::Degraded { result, cause } => {
                assert_eq!(result.text_response, APOLOGY_MESSAGE);
                assert_eq!(result.intent, "error");
                assert!(result.widget_data.is_none());
                assert!(result.vector_search.is_none());
                assert_eq!(cause.kind(), "upstream_llm");
            }
            other => panic!("expected degraded outcome, got {other:?}"),
        }
        assert!(orchestrator.sessions().get(DEFAULT_SESSION).await.is_none());
        assert_eq!(orchestrator.metrics().turn_count("error", "degraded"), 1);
    }

    #[tokio::test]
    async fn embedding_failure_suppresses_retrieval_but_still_answers() {
        let chat = Arc::new(ScriptedChat::replying("建议规律作息"));
        let orchestrator = orchestrator(FixedEmbedder::failing(3), chat.clone());

        let outcome = orchestrator
            .process(&DialogueRequest::new("我该怎么吃"), &[nutrition_item()])
            .await
            .unwrap();
        let result = outcome.into_result();
        assert_eq!(result.text_response, "建议规律作息");
        assert!(result.vector_search.is_none());
        assert!(!chat.last_prompt().contains("相关知识库内容"));
        assert_eq!(
            orchestrator.metrics().failure_count("upstream_embedding"),
            2
        );
    }

    #[tokio::test]
    async fn image_turn_accumulates_streamed_reply() {
        let chat = Arc::new(ScriptedChat::streaming(vec![Ok("这是"), Ok("[卡片]沙拉")]));
        let orchestrator = orchestrator(FixedEmbedder::new(&[], vec![1.0]), chat.clone());

        let request = DialogueRequest::new("看看这个").with_image("data:image/png;base64,AA");
        let result = orchestrator.process(&request, &[]).await.unwrap().into_result();

        assert_eq!(result.text_response, "这是[卡片]沙拉");
        assert!(result.widget_data.is_some());
        assert!(chat.last_prompt().contains("用户上传了一张图片"));
        let sent = chat.prompts.lock().unwrap();
        assert_eq!(sent[0].content.len(), 2);
    }

    #[tokio::test]
    async fn blank_input_is_rejected_before_any_upstream_call() {
        let chat = Arc::new(ScriptedChat::replying("unused"));
        let embedder = Arc::new(FixedEmbedder::new(&[], vec![1.0]));
        let orchestrator = Arc::new(DialogueOrchestrator::new(
            embedder.clone(),
            chat.clone(),
            RetrievalPolicy::default(),
        ));

        let err = orchestrator
            .process(&DialogueRequest::new("  \n\t"), &[nutrition_item()])
            .await
            .unwrap_err();
        assert!(matches!(err, XiaoxingError::Validation(_)));

        let stream = orchestrator.clone().process_stream(
            DialogueRequest::new(""),
            Arc::new(KnowledgeStore::from_items(vec![nutrition_item()])),
        );
        assert!(stream.is_err());

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sessions_count_turns_independently() {
        let chat = Arc::new(ScriptedChat::replying("好的"));
        let orchestrator = orchestrator(FixedEmbedder::new(&[], vec![1.0]), chat);

        for _ in 0..2 {
            orchestrator
                .process(&DialogueRequest::new("如何健身").with_session("alice"), &[])
                .await
                .unwrap();
        }
        orchestrator
            .process(&DialogueRequest::new("失眠怎么办"), &[])
            .await
            .unwrap();

        let alice = orchestrator.sessions().get("alice").await.unwrap();
        assert_eq!(alice.turn_count, 2);
        assert_eq!(alice.last_intent, Some(ConversationIntent::Fitness));

        let default = orchestrator.sessions().get(DEFAULT_SESSION).await.unwrap();
        assert_eq!(default.turn_count, 1);
        assert_eq!(default.last_intent, Some(ConversationIntent::SubHealth));

        assert!(orchestrator.sessions().reset("alice").await);
        assert!(!orchestrator.sessions().reset("alice").await);
        assert_eq!(orchestrator.sessions().len().await, 1);
    }

    #[tokio::test]
    async fn session_map_evicts_least_recent_turn() {
        let sessions = SessionStates::with_capacity(2);
        sessions.record_turn("a", ConversationIntent::Nutrition).await;
        sessions.record_turn("b", ConversationIntent::Fitness).await;
        sessions.record_turn("a", ConversationIntent::Nutrition).await;
        sessions.record_turn("c", ConversationIntent::Chitchat).await;

        assert_eq!(sessions.len().await, 2);
        assert!(sessions.get("b").await.is_none());
        assert_eq!(sessions.get("a").await.unwrap().turn_count, 2);
        assert_eq!(sessions.get("c").await.unwrap().turn_count, 1);
    }

    #[tokio::test]
    async fn sessions_stay_bounded_under_distinct_ids() {
        let sessions = SessionStates::with_capacity(100);
        for i in 0..1_000 {
            sessions
                .record_turn(&format!("client-{i}"), ConversationIntent::HealthKnowledge)
                .await;
        }
        assert_eq!(sessions.len().await, 100);
        assert!(sessions.get("client-999").await.is_some());
        assert!(sessions.get("client-0").await.is_none());
    }

    #[test]
    fn session_limit_is_configurable() {
        let chat = Arc::new(ScriptedChat::replying("好的"));
        let orchestrator =
            orchestrator(FixedEmbedder::new(&[], vec![1.0]), chat).with_session_limit(5);
        assert_eq!(orchestrator.sessions().capacity(), 5);
        assert_eq!(SessionStates::with_capacity(0).capacity(), 1);
        assert_eq!(SessionStates::default().capacity(), DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn session_key_truncates_long_ids() {
        let ascii = DialogueRequest::new("hi").with_session("x".repeat(500));
        assert_eq!(ascii.session_key().len(), MAX_SESSION_ID_CHARS);

        let wide = DialogueRequest::new("hi").with_session("营".repeat(200));
        assert_eq!(wide.session_key().chars().count(), MAX_SESSION_ID_CHARS);

        let short = DialogueRequest::new("hi").with_session("  bob  ");
        assert_eq!(short.session_key(), "bob");
    }

    #[tokio::test]
    async fn stream_open_failure_emits_error_then_done() {
        let chat = Arc::new(ScriptedChat::refusing_stream());
        let orchestrator = Arc::new(orchestrator(FixedEmbedder::new(&[], vec![1.0]), chat));

        let fragments: Vec<StreamFragment> = orchestrator
            .clone()
            .process_stream(DialogueRequest::new("运动"), Arc::new(KnowledgeStore::default()))
            .unwrap()
            .collect()
            .await;

        assert_eq!(fragments.len(), 2);
        match &fragments[0] {
            StreamFragment::Error { error } => assert!(error.contains("503")),
            other => panic!("expected error fragment, got {other:?}"),
        }
        assert_eq!(fragments[1], StreamFragment::Done);
        assert!(orchestrator.sessions().is_empty().await);
        assert_eq!(orchestrator.metrics().failure_count("upstream_llm"), 1);
    }

    #[tokio::test]
    async fn stream_forwards_image_to_upstream() {
        let chat = Arc::new(ScriptedChat::streaming(vec![Ok("看起来很健康")]));
        let orchestrator = Arc::new(orchestrator(
            FixedEmbedder::new(&[], vec![1.0]),
            chat.clone(),
        ));

        let fragments: Vec<StreamFragment> = orchestrator
            .process_stream(
                DialogueRequest::new("这顿饭怎么样").with_image("data:image/png;base64,AAAA"),
                Arc::new(KnowledgeStore::default()),
            )
            .unwrap()
            .collect()
            .await;
        assert_eq!(fragments.last(), Some(&StreamFragment::Done));

        let prompts = chat.prompts.lock().unwrap();
        let content = &prompts.last().unwrap().content;
        assert_eq!(content.len(), 2);
        assert_eq!(
            content[1],
            ContentPart::ImageUrl {
                image_url: ImageRef {
                    url: "data:image/png;base64,AAAA".into()
                }
            }
        );
    }

    #[tokio::test]
    async fn stream_complete_carries_vector_search() {
        let chat = Arc::new(ScriptedChat::streaming(vec![Ok("多吃蔬菜")]));
        let orchestrator = Arc::new(orchestrator(
            FixedEmbedder::new(&[], vec![1.0, 0.0]),
            chat,
        ));

        let fragments: Vec<StreamFragment> = orchestrator
            .process_stream(
                DialogueRequest::new("我该怎么吃"),
                Arc::new(KnowledgeStore::from_items(vec![nutrition_item()])),
            )
            .unwrap()
            .collect()
            .await;

        match &fragments[1] {
            StreamFragment::Complete { vector_search, .. } => {
                let search = vector_search.as_ref().expect("diagnostic present");
                assert!(search.enabled);
                assert_eq!(search.total_knowledge, 1);
                assert_eq!(search.retrieved_count, 1);
                assert_eq!(search.top_matches[0].category, "nutrition");
                assert_eq!(search.top_matches[0].score, 1.0);
            }
            other => panic!("expected complete fragment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_emits_deltas_complete_then_done() {
        let chat = Arc::new(ScriptedChat::streaming(vec![Ok("多喝水"), Ok("[展示]")]));
        let orchestrator = Arc::new(orchestrator(FixedEmbedder::new(&[], vec![1.0]), chat));

        let fragments: Vec<StreamFragment> = orchestrator
            .clone()
            .process_stream(
                DialogueRequest::new("饮食建议").with_session("s1"),
                Arc::new(KnowledgeStore::default()),
            )
            .unwrap()
            .collect()
            .await;

        assert_eq!(fragments.len(), 4);
        assert_eq!(
            fragments[0],
            StreamFragment::Delta {
                content: "多喝水".into()
            }
        );
        match &fragments[2] {
            StreamFragment::Complete {
                intent,
                widget_data,
                vector_search,
            } => {
                assert_eq!(intent, "nutrition");
                assert!(widget_data.is_some());
                assert!(vector_search.is_none());
            }
            other => panic!("expected complete fragment, got {other:?}"),
        }
        assert_eq!(fragments[3], StreamFragment::Done);
        assert_eq!(orchestrator.sessions().get("s1").await.unwrap().turn_count, 1);
    }

    #[tokio::test]
    async fn stream_failure_emits_error_then_done() {
        let chat = Arc::new(ScriptedChat::streaming(vec![Ok("部分"), Err("connection reset")]));
        let orchestrator = Arc::new(orchestrator(FixedEmbedder::new(&[], vec![1.0]), chat));

        let fragments: Vec<StreamFragment> = orchestrator
            .clone()
            .process_stream(DialogueRequest::new("失眠"), Arc::new(KnowledgeStore::default()))
            .unwrap()
            .collect()
            .await;

        assert_eq!(fragments.len(), 3);
        assert!(matches!(&fragments[0], StreamFragment::Delta { .. }));
        match &fragments[1] {
            StreamFragment::Error { error } => assert!(error.contains("connection reset")),
            other => panic!("expected error fragment, got {other:?}"),
        }
        assert_eq!(fragments[2], StreamFragment::Done);
        assert!(orchestrator.sessions().is_empty().await);
    }
}
