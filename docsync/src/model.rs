use chrono::{SecondsFormat, Utc};
use docsync_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Schema-free record as produced by a source connector or attachment fetch.
pub type RawRecord = serde_json::Map<String, Value>;

/// Current UTC time as an ISO-8601 string, used when a source supplies no timestamp.
pub fn iso_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn pop_id(record: &mut RawRecord) -> Result<String> {
    match record.remove("_id") {
        Some(Value::String(id)) => Ok(id),
        Some(other) => Err(Error::Validation(format!(
            "document _id must be a string, got {other}"
        ))),
        None => Err(Error::Validation("document is missing _id".to_string())),
    }
}

/// A source document with its reserved fields split out from the open field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Opaque, source-defined; only ever compared for equality.
    pub timestamp: Option<String>,
    pub fields: RawRecord,
}

impl Document {
    /// Builds a document from a raw source record, popping the internal `_id`
    /// key (republished as `id` in the index body) and the `timestamp` key.
    pub fn from_source(mut record: RawRecord) -> Result<Self> {
        let id = pop_id(&mut record)?;
        let timestamp = match record.remove("timestamp") {
            Some(Value::String(ts)) => Some(ts),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        Ok(Self {
            id,
            timestamp,
            fields: record,
        })
    }

    /// Renders the index body: `id`, `timestamp` when present, then the
    /// pass-through fields.
    pub fn into_body(self) -> RawRecord {
        let mut body = self.fields;
        body.insert("id".to_string(), Value::String(self.id));
        if let Some(ts) = self.timestamp {
            body.insert("timestamp".to_string(), Value::String(ts));
        }
        body
    }
}

/// A single index mutation, consumed exactly once by the bulker.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOperation {
    Update {
        index: String,
        id: String,
        body: RawRecord,
    },
    Delete {
        index: String,
        id: String,
    },
}

impl IndexOperation {
    pub fn update(index: impl Into<String>, id: impl Into<String>, body: RawRecord) -> Self {
        Self::Update {
            index: index.into(),
            id: id.into(),
            body,
        }
    }

    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Delete {
            index: index.into(),
            id: id.into(),
        }
    }

    pub fn doc_id(&self) -> &str {
        match self {
            Self::Update { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    /// Appends the flat action/body entries the bulk call expects: an action
    /// descriptor for every operation, a `doc_as_upsert` body for updates.
    pub fn encode_into(&self, entries: &mut Vec<Value>) {
        match self {
            Self::Update { index, id, body } => {
                entries.push(json!({"update": {"_index": index, "_id": id}}));
                entries.push(json!({"doc": body, "doc_as_upsert": true}));
            }
            Self::Delete { index, id } => {
                entries.push(json!({"delete": {"_index": index, "_id": id}}));
            }
        }
    }
}

/// Hand-off channel item. The two end markers are sent exactly once each by
/// the fetcher's document and attachment sub-flows.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkItem {
    Op(IndexOperation),
    DocsDone,
    AttachmentsDone,
}

/// Point-in-time id/timestamp state of the index, captured before a run and
/// never refreshed during it.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    entries: HashMap<String, Option<String>>,
}

impl IndexSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: String, timestamp: Option<String>) {
        self.entries.insert(id, timestamp);
    }

    /// True when the index already holds this id with the same timestamp.
    pub fn is_unchanged(&self, id: &str, timestamp: &str) -> bool {
        matches!(self.entries.get(id), Some(Some(ts)) if ts == timestamp)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub documents_seen: u64,
    pub documents_skipped: u64,
    pub updates: u64,
    pub deletes: u64,
    pub attachments_indexed: u64,
    pub attachment_failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub bulk_calls: u64,
    /// Logical operations acknowledged by bulk calls.
    pub documents_indexed: u64,
    /// Cumulative time spent inside bulk calls.
    pub bulk_time: Duration,
}

/// Aggregate result of one synchronization run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub fetch: FetchReport,
    pub bulk: BulkReport,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(entries: &[(&str, Value)]) -> RawRecord {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn from_source_pops_reserved_fields() {
        let raw = record(&[
            ("_id", json!("doc-1")),
            ("timestamp", json!("2024-05-01T00:00:00Z")),
            ("title", json!("hello")),
        ]);

        let doc = Document::from_source(raw).unwrap();
        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.timestamp.as_deref(), Some("2024-05-01T00:00:00Z"));
        assert_eq!(doc.fields, record(&[("title", json!("hello"))]));
    }

    #[test]
    fn from_source_rejects_missing_id() {
        let raw = record(&[("title", json!("orphan"))]);
        assert!(matches!(
            Document::from_source(raw),
            Err(docsync_core::Error::Validation(_))
        ));
    }

    #[test]
    fn body_republishes_id_and_timestamp() {
        let doc = Document {
            id: "doc-2".to_string(),
            timestamp: Some("t1".to_string()),
            fields: record(&[("lang", json!("en"))]),
        };

        let body = doc.into_body();
        assert_eq!(
            body,
            record(&[
                ("lang", json!("en")),
                ("id", json!("doc-2")),
                ("timestamp", json!("t1")),
            ])
        );
    }

    #[test]
    fn update_encodes_action_and_upsert_body() {
        let op = IndexOperation::update("pages", "a", record(&[("k", json!(1))]));
        let mut entries = Vec::new();
        op.encode_into(&mut entries);

        assert_eq!(
            entries,
            vec![
                json!({"update": {"_index": "pages", "_id": "a"}}),
                json!({"doc": {"k": 1}, "doc_as_upsert": true}),
            ]
        );
    }

    #[test]
    fn delete_encodes_bare_action() {
        let op = IndexOperation::delete("pages", "b");
        let mut entries = Vec::new();
        op.encode_into(&mut entries);

        assert_eq!(entries, vec![json!({"delete": {"_index": "pages", "_id": "b"}})]);
    }

    #[test]
    fn snapshot_matches_only_equal_timestamps() {
        let mut snapshot = IndexSnapshot::new();
        snapshot.insert("a".to_string(), Some("t1".to_string()));
        snapshot.insert("b".to_string(), None);

        assert!(snapshot.is_unchanged("a", "t1"));
        assert!(!snapshot.is_unchanged("a", "t2"));
        assert!(!snapshot.is_unchanged("b", "t1"));
        assert!(!snapshot.is_unchanged("missing", "t1"));
    }
}
