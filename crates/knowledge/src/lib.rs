use axum::{
    extract::{FromRef, Path as UrlPath, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;

pub mod similarity;

pub use similarity::{cosine_similarity, rank, top_k, ScoredMatch};

/// File name expected inside every category directory.
pub const KNOWLEDGE_FILE: &str = "knowledge.json";

pub type MetricsRecorder = dyn Fn(Method, &'static str, StatusCode, Instant) + Send + Sync;

/// Topic bucket a knowledge item belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    Nutrition,
    Fitness,
    SubHealth,
    General,
}

impl KnowledgeCategory {
    /// Load order of the corpus.
    pub const ALL: [KnowledgeCategory; 4] = [
        KnowledgeCategory::Nutrition,
        KnowledgeCategory::Fitness,
        KnowledgeCategory::SubHealth,
        KnowledgeCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeCategory::Nutrition => "nutrition",
            KnowledgeCategory::Fitness => "fitness",
            KnowledgeCategory::SubHealth => "sub_health",
            KnowledgeCategory::General => "general",
        }
    }
}

impl fmt::Display for KnowledgeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KnowledgeCategory {
    type Err = KnowledgeLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KnowledgeCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| KnowledgeLoadError::UnknownCategory(s.to_string()))
    }
}

/// A short health fact. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeItem {
    pub content: String,
    /// Always set for items loaded from disk; callers may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<KnowledgeCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl KnowledgeItem {
    pub fn new(content: impl Into<String>, category: KnowledgeCategory) -> Self {
        Self {
            content: content.into(),
            category: Some(category),
            source: None,
            keywords: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Category label used in diagnostics; `"unknown"` when untagged.
    pub fn category_label(&self) -> &'static str {
        self.category.map(|c| c.as_str()).unwrap_or("unknown")
    }

    fn matches_keyword(&self, keyword_lower: &str) -> bool {
        if self.content.to_lowercase().contains(keyword_lower) {
            return true;
        }
        self.keywords
            .join(" ")
            .to_lowercase()
            .contains(keyword_lower)
    }
}

/// Entry as stored in a category file. Any `category` field in the file is
/// ignored; the directory decides.
#[derive(Debug, Deserialize)]
struct RawKnowledgeEntry {
    content: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Error)]
pub enum KnowledgeLoadError {
    #[error("knowledge file not found: {0}")]
    Missing(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown knowledge category: {0}")]
    UnknownCategory(String),
}

/// Path of the file holding `category` below `base`.
pub fn category_file(base: &Path, category: KnowledgeCategory) -> PathBuf {
    base.join(category.as_str()).join(KNOWLEDGE_FILE)
}

/// Loads one category file and tags every entry with `category`.
pub fn load_category(
    base: &Path,
    category: KnowledgeCategory,
) -> Result<Vec<KnowledgeItem>, KnowledgeLoadError> {
    let path = category_file(base, category);
    if !path.exists() {
        return Err(KnowledgeLoadError::Missing(path));
    }

    let content = fs::read_to_string(&path).map_err(|source| KnowledgeLoadError::Io {
        path: path.clone(),
        source,
    })?;
    let entries: Vec<RawKnowledgeEntry> =
        serde_json::from_str(&content).map_err(|source| KnowledgeLoadError::Parse {
            path: path.clone(),
            source,
        })?;

    Ok(entries
        .into_iter()
        .map(|raw| KnowledgeItem {
            content: raw.content,
            category: Some(category),
            source: raw.source,
            keywords: raw.keywords,
        })
        .collect())
}

/// Loads every category in [`KnowledgeCategory::ALL`] order.
///
/// Categories that fail to load are logged and skipped, so the result may be
/// partial or empty but never an error.
pub fn load_all(base: &Path) -> Vec<KnowledgeItem> {
    let mut all = Vec::new();
    for category in KnowledgeCategory::ALL {
        match load_category(base, category) {
            Ok(items) => {
                tracing::info!(category = %category, count = items.len(), "knowledge category loaded");
                all.extend(items);
            }
            Err(KnowledgeLoadError::Missing(path)) => {
                tracing::warn!(category = %category, path = %path.display(), "knowledge file missing, skipping");
            }
            Err(err) => {
                tracing::error!(category = %category, error = %err, "failed to load knowledge category");
            }
        }
    }
    tracing::info!(total = all.len(), base = %base.display(), "knowledge base loaded");
    all
}

/// Per-category counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeStats {
    pub total: usize,
    pub categories: BTreeMap<String, usize>,
}

/// The in-memory corpus, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeStore {
    items: Vec<KnowledgeItem>,
}

impl KnowledgeStore {
    pub fn load(base: impl AsRef<Path>) -> Self {
        Self {
            items: load_all(base.as_ref()),
        }
    }

    pub fn from_items(items: Vec<KnowledgeItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[KnowledgeItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn by_category(&self, category: KnowledgeCategory) -> Vec<&KnowledgeItem> {
        self.items
            .iter()
            .filter(|item| item.category == Some(category))
            .collect()
    }

    /// Case-insensitive substring search over content and keyword tags.
    pub fn search_by_keyword(&self, keyword: &str) -> Vec<KnowledgeItem> {
        let keyword_lower = keyword.to_lowercase();
        let results: Vec<KnowledgeItem> = self
            .items
            .iter()
            .filter(|item| item.matches_keyword(&keyword_lower))
            .cloned()
            .collect();
        tracing::debug!(keyword, hits = results.len(), "knowledge keyword search");
        results
    }

    pub fn stats(&self) -> KnowledgeStats {
        let mut categories = BTreeMap::new();
        for item in &self.items {
            *categories
                .entry(item.category_label().to_string())
                .or_insert(0) += 1;
        }
        KnowledgeStats {
            total: self.items.len(),
            categories,
        }
    }
}

/// Router state for the knowledge endpoints.
#[derive(Clone)]
pub struct KnowledgeState {
    store: Arc<KnowledgeStore>,
    metrics: Arc<MetricsRecorder>,
}

impl KnowledgeState {
    pub fn new(store: Arc<KnowledgeStore>, metrics: Arc<MetricsRecorder>) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> Arc<KnowledgeStore> {
        self.store.clone()
    }

    fn record(&self, method: Method, path: &'static str, status: StatusCode, started: Instant) {
        (self.metrics)(method, path, status, started);
    }
}

pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    KnowledgeState: FromRef<S>,
{
    // Nested under /api/knowledge in core; metrics use the full paths.
    Router::<S>::new()
        .route("/stats", get(stats_handler))
        .route("/search", get(search_handler))
        .route("/category/{category}", get(category_handler))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub keyword: String,
    pub count: usize,
    pub items: Vec<KnowledgeItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CategoryResponse {
    pub category: KnowledgeCategory,
    pub items: Vec<KnowledgeItem>,
}

async fn stats_handler(State(state): State<KnowledgeState>) -> Response {
    let started = Instant::now();
    let stats = state.store.stats();
    state.record(Method::GET, "/api/knowledge/stats", StatusCode::OK, started);
    (StatusCode::OK, Json(stats)).into_response()
}

async fn search_handler(
    State(state): State<KnowledgeState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let started = Instant::now();
    let keyword = params.q.trim();
    if keyword.is_empty() {
        state.record(
            Method::GET,
            "/api/knowledge/search",
            StatusCode::BAD_REQUEST,
            started,
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "detail": "keyword must not be empty" })),
        )
            .into_response();
    }

    let items = state.store.search_by_keyword(keyword);
    state.record(Method::GET, "/api/knowledge/search", StatusCode::OK, started);
    (
        StatusCode::OK,
        Json(SearchResponse {
            keyword: keyword.to_string(),
            count: items.len(),
            items,
        }),
    )
        .into_response()
}

async fn category_handler(
    State(state): State<KnowledgeState>,
    UrlPath(category): UrlPath<String>,
) -> Response {
    let started = Instant::now();
    let Ok(category) = category.parse::<KnowledgeCategory>() else {
        state.record(
            Method::GET,
            "/api/knowledge/category",
            StatusCode::NOT_FOUND,
            started,
        );
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "detail": format!("unknown category '{category}'") })),
        )
            .into_response();
    };

    let items = state
        .store
        .by_category(category)
        .into_iter()
        .cloned()
        .collect();
    state.record(Method::GET, "/api/knowledge/category", StatusCode::OK, started);
    (StatusCode::OK, Json(CategoryResponse { category, items })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn sample_store() -> KnowledgeStore {
        KnowledgeStore::from_items(vec![
            KnowledgeItem::new("每天保证摄入200-350克新鲜水果", KnowledgeCategory::Nutrition)
                .with_keywords(["Fruit", "水果"]),
            KnowledgeItem::new("力量训练每周建议2-3次", KnowledgeCategory::Fitness),
            KnowledgeItem::new("Sleep 7-8 hours", KnowledgeCategory::SubHealth),
        ])
    }

    fn app() -> Router {
        let state = KnowledgeState::new(Arc::new(sample_store()), Arc::new(|_, _, _, _| {}));
        router().with_state(state)
    }

    #[test]
    fn keyword_search_is_case_insensitive_over_content_and_tags() {
        let store = sample_store();
        assert_eq!(store.search_by_keyword("SLEEP").len(), 1);
        assert_eq!(store.search_by_keyword("fruit").len(), 1);
        assert_eq!(store.search_by_keyword("训练").len(), 1);
        assert!(store.search_by_keyword("血压").is_empty());
    }

    #[test]
    fn stats_count_per_category() {
        let stats = sample_store().stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.categories.get("nutrition"), Some(&1));
        assert_eq!(stats.categories.get("sub_health"), Some(&1));
        assert_eq!(stats.categories.get("general"), None);
    }

    #[test]
    fn untagged_items_report_unknown_category() {
        let item: KnowledgeItem = serde_json::from_str(r#"{"content": "喝水"}"#).unwrap();
        assert_eq!(item.category_label(), "unknown");
    }

    #[test]
    fn category_parses_from_snake_case() {
        assert_eq!(
            "sub_health".parse::<KnowledgeCategory>().unwrap(),
            KnowledgeCategory::SubHealth
        );
        assert!("cardio".parse::<KnowledgeCategory>().is_err());
    }

    #[tokio::test]
    async fn stats_route_returns_counts() {
        let res = app()
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = res.into_body().collect().await.unwrap().to_bytes();
        let stats: KnowledgeStats = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn search_route_rejects_blank_keyword() {
        let res = app()
            .oneshot(Request::get("/search?q=%20").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn category_route_filters_and_rejects_unknown() {
        let res = app()
            .clone()
            .oneshot(Request::get("/category/fitness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let response: CategoryResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.items.len(), 1);

        let res = app()
            .oneshot(Request::get("/category/cardio").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
