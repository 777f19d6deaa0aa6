use chrono::Utc;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    env, fs,
    io::Write,
    path::{Path, PathBuf},
};
use ulid::Ulid;

pub const EVENT_SINK_ENV: &str = "XIAOXING_EVENT_SINK";
const EVENT_VERSION: &str = "1.0.0";
const EVENT_SOURCE: &str = "xiaoxing-core";

/// One line of the JSONL event log.
#[derive(Debug, Serialize)]
pub struct EventRecord<'a> {
    pub id: String,
    pub ts: String,
    pub version: &'static str,
    pub kind: &'a str,
    pub level: &'a str,
    pub source: &'static str,
    pub node: String,
    pub labels: BTreeMap<&'a str, serde_json::Value>,
    pub data: serde_json::Value,
}

/// Optional append-only JSONL sink for chat request/response events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    path: Option<PathBuf>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Enabled when `XIAOXING_EVENT_SINK` names a file.
    pub fn from_env() -> Self {
        Self {
            path: env::var(EVENT_SINK_ENV)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Appends one event. Write failures are logged and otherwise ignored.
    pub fn write(
        &self,
        kind: &str,
        level: &str,
        labels: BTreeMap<&str, serde_json::Value>,
        data: serde_json::Value,
    ) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let record = EventRecord {
            id: Ulid::new().to_string(),
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            version: EVENT_VERSION,
            kind,
            level,
            source: EVENT_SOURCE,
            node: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".into()),
            labels,
            data,
        };
        if let Err(err) = append_line(path, &record) {
            tracing::warn!(path = %path.display(), error = %err, "failed to write event to sink");
        }
    }
}

fn append_line(path: &Path, record: &EventRecord<'_>) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, record)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// First `max` characters of `text`, for event payloads.
pub fn preview(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disabled_sink_writes_nothing() {
        let sink = EventSink::disabled();
        assert!(!sink.is_enabled());
        sink.write("chat.request", "info", BTreeMap::new(), json!({}));
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/events.jsonl");
        let sink = EventSink::to_file(&path);

        let mut labels = BTreeMap::new();
        labels.insert("intent", json!("nutrition"));
        sink.write("chat.request", "info", labels.clone(), json!({"preview": "吃"}));
        sink.write("chat.response", "info", labels, json!({"latency_ms": 12}));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "chat.request");
        assert_eq!(lines[0]["source"], "xiaoxing-core");
        assert_eq!(lines[0]["labels"]["intent"], "nutrition");
        assert_eq!(lines[1]["data"]["latency_ms"], 12);
        assert_ne!(lines[0]["id"], lines[1]["id"]);
    }

    #[test]
    fn preview_counts_characters() {
        assert_eq!(preview("营养膳食建议", 2), "营养");
        assert_eq!(preview("ab", 10), "ab");
    }
}
