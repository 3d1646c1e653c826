//! Provider records and the ordered work list that feeds a run.
//!
//! A work list is a JSON array or an NDJSON stream whose entries are either
//! bare provider ids (integers or strings) or full record objects. Bare ids are
//! turned into records through a [`RecordFetcher`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::IngestError;

/// Kind of media a record points at. Images hang off the TitleSource,
/// videos off the GameVariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
    pub metadata: Value,
}

/// One provider's observation of a game.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    pub id: String,
    pub name: Option<String>,
    pub platforms: Vec<String>,
    /// provider key -> that provider's id for the same game
    pub cross_refs: BTreeMap<String, String>,
    pub media: Vec<MediaRef>,
    pub rating: Option<f64>,
    pub release_date: Option<NaiveDate>,
    pub synopsis: Option<String>,
    pub raw: Value,
}

impl ProviderRecord {
    pub fn from_value(raw: Value) -> Result<Self, IngestError> {
        let obj = raw.as_object().ok_or_else(|| IngestError::MalformedRecord {
            message: format!("expected object, got {}", json_kind(&raw)),
        })?;

        let id = obj
            .get("id")
            .and_then(id_from_value)
            .ok_or_else(|| IngestError::MalformedRecord {
                message: "record has no usable id".to_string(),
            })?;

        let name = ["name", "title"]
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string);

        let mut platforms: Vec<String> = Vec::new();
        for key in ["platform", "platforms"] {
            match obj.get(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => platforms.push(s.trim().to_string()),
                Some(Value::Array(items)) => {
                    for item in items {
                        let label = item
                            .as_str()
                            .or_else(|| item.get("name").and_then(Value::as_str));
                        if let Some(label) = label.map(str::trim).filter(|s| !s.is_empty()) {
                            platforms.push(label.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        platforms.dedup();

        let mut cross_refs = BTreeMap::new();
        if let Some(Value::Object(refs)) = obj.get("refs").or_else(|| obj.get("cross_refs")) {
            for (provider, other_id) in refs {
                let provider = provider.trim();
                if provider.is_empty() {
                    continue;
                }
                match id_from_value(other_id) {
                    Some(other) => {
                        cross_refs.insert(provider.to_string(), other);
                    }
                    None => debug!(provider, record_id = %id, "ignoring unusable cross-reference id"),
                }
            }
        }

        let mut media = Vec::new();
        collect_media(obj.get("images"), MediaKind::Image, &mut media);
        collect_media(obj.get("videos"), MediaKind::Video, &mut media);

        let rating = obj.get("rating").and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        });

        let release_date = obj
            .get("release_date")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok());

        let synopsis = ["synopsis", "description", "summary"]
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            id,
            name,
            platforms,
            cross_refs,
            media,
            rating,
            release_date,
            synopsis,
            raw,
        })
    }

    /// Numeric form of the provider id, when it has one.
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.parse::<i64>().ok()
    }
}

fn collect_media(value: Option<&Value>, kind: MediaKind, out: &mut Vec<MediaRef>) {
    let Some(Value::Array(items)) = value else {
        return;
    };
    for item in items {
        let (url, metadata) = match item {
            Value::String(s) => (s.trim().to_string(), Value::Object(Default::default())),
            Value::Object(map) => match map.get("url").and_then(Value::as_str) {
                Some(u) => (u.trim().to_string(), item.clone()),
                None => continue,
            },
            _ => continue,
        };
        if url.is_empty() || out.iter().any(|m| m.kind == kind && m.url == url) {
            continue;
        }
        out.push(MediaRef {
            kind,
            url,
            metadata,
        });
    }
}

fn id_from_value(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Entry of the ordered work list.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    Id(String),
    Record(ProviderRecord),
}

impl WorkItem {
    pub fn id(&self) -> &str {
        match self {
            WorkItem::Id(id) => id,
            WorkItem::Record(r) => &r.id,
        }
    }

    /// Interpret a raw entry. Objects that fail record validation are kept as
    /// `Malformed` so they count as per-item failures instead of aborting the run.
    fn from_entry(value: Value) -> ParsedEntry {
        match &value {
            Value::Number(_) | Value::String(_) => match id_from_value(&value) {
                Some(id) => ParsedEntry::Item(WorkItem::Id(id)),
                None => ParsedEntry::Malformed {
                    message: "blank id".to_string(),
                },
            },
            Value::Object(_) => match ProviderRecord::from_value(value) {
                Ok(r) => ParsedEntry::Item(WorkItem::Record(r)),
                Err(e) => ParsedEntry::Malformed {
                    message: e.to_string(),
                },
            },
            other => ParsedEntry::Malformed {
                message: format!("unsupported entry type {}", json_kind(other)),
            },
        }
    }
}

enum ParsedEntry {
    Item(WorkItem),
    Malformed { message: String },
}

/// Work list entry as handed to a pipeline: either an item, or a placeholder
/// for an entry that could not be understood.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkEntry {
    Item(WorkItem),
    Malformed { position: usize, message: String },
}

impl WorkEntry {
    pub fn label(&self) -> String {
        match self {
            WorkEntry::Item(item) => item.id().to_string(),
            WorkEntry::Malformed { position, .. } => format!("#{position}"),
        }
    }
}

/// Parse a work list from text: a JSON array, or NDJSON (one entry per line).
pub fn parse_work_list(text: &str, origin: &str) -> Result<Vec<WorkEntry>, IngestError> {
    let trimmed = text.trim_start();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<Value>>(trimmed).map_err(|e| IngestError::InputParse {
            path: origin.to_string(),
            entry: 0,
            message: e.to_string(),
        })?
    } else {
        let mut out = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let v = serde_json::from_str::<Value>(line).map_err(|e| IngestError::InputParse {
                path: origin.to_string(),
                entry: line_no + 1,
                message: e.to_string(),
            })?;
            out.push(v);
        }
        out
    };

    Ok(values
        .into_iter()
        .enumerate()
        .map(|(position, v)| match WorkItem::from_entry(v) {
            ParsedEntry::Item(item) => WorkEntry::Item(item),
            ParsedEntry::Malformed { message } => {
                warn!(origin, position, %message, "malformed work list entry");
                WorkEntry::Malformed { position, message }
            }
        })
        .collect())
}

/// Read and parse a work list file. Any failure here is fatal for the run.
pub async fn load_work_list(path: &Path) -> Result<Vec<WorkEntry>, IngestError> {
    let origin = path.display().to_string();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| IngestError::InputUnreadable {
            path: origin.clone(),
            message: e.to_string(),
        })?;
    parse_work_list(&text, &origin)
}

/// Source of full provider records for bare work list ids.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Option<ProviderRecord>>;
}

/// Serves records out of a provider dump loaded into memory.
#[derive(Debug, Default, Clone)]
pub struct DumpRecordFetcher {
    records: HashMap<String, ProviderRecord>,
}

impl DumpRecordFetcher {
    pub fn from_records(records: impl IntoIterator<Item = ProviderRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self, IngestError> {
        let entries = load_work_list(path).await?;
        let records = entries.into_iter().filter_map(|e| match e {
            WorkEntry::Item(WorkItem::Record(r)) => Some(r),
            _ => None,
        });
        Ok(Self::from_records(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordFetcher for DumpRecordFetcher {
    async fn fetch(&self, id: &str) -> Result<Option<ProviderRecord>> {
        Ok(self.records.get(id).cloned())
    }
}

/// Timeout and fixed-backoff retry policy for provider calls.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Fetch one record, retrying timeouts and errors with a fixed backoff.
pub async fn fetch_with_retry(
    fetcher: &dyn RecordFetcher,
    id: &str,
    policy: FetchPolicy,
) -> Result<ProviderRecord, IngestError> {
    let attempts = policy.attempts.max(1);
    let mut timed_out = false;
    let mut last_error: Option<String> = None;
    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, fetcher.fetch(id)).await {
            Ok(Ok(Some(record))) => return Ok(record),
            Ok(Ok(None)) => {
                return Err(IngestError::RecordUnavailable {
                    item_id: id.to_string(),
                })
            }
            Ok(Err(err)) => {
                warn!(item_id = id, attempt, error = %err, "record fetch failed");
                timed_out = false;
                last_error = Some(err.to_string());
            }
            Err(_) => {
                warn!(item_id = id, attempt, timeout_ms = policy.timeout.as_millis() as u64, "record fetch timed out");
                timed_out = true;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }
    if timed_out {
        Err(IngestError::FetchTimeout {
            item_id: id.to_string(),
            attempts,
        })
    } else {
        Err(IngestError::MalformedRecord {
            message: format!(
                "record {id} could not be fetched: {}",
                last_error.unwrap_or_default()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn record_fields_are_extracted() {
        let rec = ProviderRecord::from_value(json!({
            "id": 42,
            "name": "  Foo: Deluxe Edition ",
            "platforms": ["PS5", {"name": "PC"}, ""],
            "refs": {"provider_b": 77, "provider_c": "abc", "": 1},
            "images": ["https://img/1.jpg", {"url": "https://img/2.jpg", "w": 10}, "https://img/1.jpg"],
            "videos": [{"url": "https://vid/1.mp4"}],
            "rating": "4.5",
            "release_date": "2020-11-12T00:00:00Z",
            "description": "A game."
        }))
        .unwrap();

        assert_eq!(rec.id, "42");
        assert_eq!(rec.numeric_id(), Some(42));
        assert_eq!(rec.name.as_deref(), Some("Foo: Deluxe Edition"));
        assert_eq!(rec.platforms, vec!["PS5".to_string(), "PC".to_string()]);
        assert_eq!(rec.cross_refs.get("provider_b").map(String::as_str), Some("77"));
        assert_eq!(rec.cross_refs.len(), 2);
        assert_eq!(rec.media.len(), 3);
        assert_eq!(rec.media[2].kind, MediaKind::Video);
        assert_eq!(rec.rating, Some(4.5));
        assert_eq!(rec.release_date, NaiveDate::from_ymd_opt(2020, 11, 12));
        assert_eq!(rec.synopsis.as_deref(), Some("A game."));
    }

    #[test]
    fn record_without_id_is_malformed() {
        let err = ProviderRecord::from_value(json!({"name": "x"})).unwrap_err();
        assert!(matches!(err, IngestError::MalformedRecord { .. }));
    }

    #[test]
    fn work_list_accepts_array_and_ndjson() {
        let arr = parse_work_list(r#"[1, "2", {"id":3,"name":"Foo"}, true]"#, "mem").unwrap();
        assert_eq!(arr.len(), 4);
        assert_eq!(arr[0], WorkEntry::Item(WorkItem::Id("1".into())));
        assert_eq!(arr[1], WorkEntry::Item(WorkItem::Id("2".into())));
        assert!(matches!(arr[2], WorkEntry::Item(WorkItem::Record(_))));
        assert!(matches!(arr[3], WorkEntry::Malformed { position: 3, .. }));

        let nd = parse_work_list("{\"id\":1,\"name\":\"A\"}\n\n{\"id\":2}\n", "mem").unwrap();
        assert_eq!(nd.len(), 2);
    }

    #[test]
    fn unparseable_input_is_fatal() {
        let err = parse_work_list("{\"id\":1}\nnot json\n", "mem").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, IngestError::InputParse { entry: 2, .. }));
    }

    #[tokio::test]
    async fn missing_input_file_is_fatal() {
        let err = load_work_list(Path::new("/definitely/not/here.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InputUnreadable { .. }));
    }

    struct SlowThenOk {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RecordFetcher for SlowThenOk {
        async fn fetch(&self, id: &str) -> Result<Option<ProviderRecord>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(Some(ProviderRecord::from_value(json!({"id": id, "name": "Late"}))?))
        }
    }

    #[tokio::test]
    async fn fetch_retries_after_timeout() {
        let fetcher = SlowThenOk {
            calls: AtomicU32::new(0),
        };
        let policy = FetchPolicy {
            timeout: Duration::from_millis(20),
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let rec = fetch_with_retry(&fetcher, "9", policy).await.unwrap();
        assert_eq!(rec.name.as_deref(), Some("Late"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_reports_unavailable_without_retry() {
        let dump = DumpRecordFetcher::default();
        let err = fetch_with_retry(&dump, "1", FetchPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::RecordUnavailable { .. }));
    }
}
