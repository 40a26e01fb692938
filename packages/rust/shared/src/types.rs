//! Core domain types for GeoHarvest: sources, jobs, tracking records,
//! parsed documents and the normalized records they turn into.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::error::HarvestError;

/// Generate a new time-sortable identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// SHA-256 hex digest of a stored document.
pub fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Sources & jobs
// ---------------------------------------------------------------------------

/// Which discovery/retrieval strategy a source uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Paged catalog queries (CSW).
    Csw,
    /// Web accessible folder: an index page linking sibling documents.
    Waf,
    /// One document at a fixed URL.
    Single,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csw => "csw",
            Self::Waf => "waf",
            Self::Single => "single",
        }
    }

    /// Whether the remote side can be enumerated and diffed against local state.
    pub fn computes_deletions(&self) -> bool {
        matches!(self, Self::Csw)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csw" => Ok(Self::Csw),
            "waf" => Ok(Self::Waf),
            "single" | "gemini-single" => Ok(Self::Single),
            other => Err(HarvestError::config(format!("unknown source kind '{other}'"))),
        }
    }
}

/// A remote catalog this harvester pulls from.
#[derive(Debug, Clone)]
pub struct HarvestSource {
    pub id: String,
    pub url: String,
    pub kind: SourceKind,
    pub config: SourceConfig,
    /// Inactive sources lose ties on equal metadata dates.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a harvest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Counters reported at the end of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub gathered: usize,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errored: usize,
}

/// One run of gather -> fetch -> import against a source.
#[derive(Debug, Clone)]
pub struct HarvestJob {
    pub id: String,
    pub source_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: JobStats,
}

// ---------------------------------------------------------------------------
// Tracking records
// ---------------------------------------------------------------------------

/// Reconciliation verdict attached to a tracking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    New,
    Change,
    Delete,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Change => "change",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "change" => Some(Self::Change),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Where a tracking record is in the pipeline.
///
/// `Pending -> Fetched -> Imported`, with `Errored` reachable from either of
/// the first two. Records that arrive with content start at `Fetched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    Pending,
    Fetched,
    Imported,
    Errored,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetched => "fetched",
            Self::Imported => "imported",
            Self::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fetched" => Some(Self::Fetched),
            "imported" => Some(Self::Imported),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }

    /// Whether moving to `next` is a legal step.
    pub fn can_transition_to(&self, next: ObjectState) -> bool {
        use ObjectState::*;
        matches!(
            (self, next),
            (Pending, Fetched)
                | (Pending, Errored)
                | (Fetched, Imported)
                | (Fetched, Errored)
                | (Pending, Imported)
        )
    }
}

/// One harvest attempt of one remote identifier within one job.
#[derive(Debug, Clone)]
pub struct TrackingRecord {
    pub id: String,
    /// Remote identifier (GUID) as assigned by the catalog.
    pub guid: String,
    pub job_id: String,
    pub source_id: String,
    pub status: ObjectStatus,
    pub state: ObjectState,
    /// Decoded document text, without its XML declaration.
    pub content: Option<String>,
    /// Encoding the raw bytes were decoded from.
    pub content_encoding: Option<String>,
    /// SHA-256 of `content`.
    pub content_hash: Option<String>,
    /// The normalized record this attempt produced or refers to.
    pub record_id: Option<String>,
    pub current: bool,
    pub metadata_modified: Option<NaiveDateTime>,
    /// Protocol-specific locator, also used for coupling.
    pub source_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TrackingRecord {
    /// A fresh pending record for `guid` in `job_id`.
    pub fn new(guid: &str, job_id: &str, source_id: &str, status: ObjectStatus) -> Self {
        Self {
            id: new_id(),
            guid: guid.to_string(),
            job_id: job_id.to_string(),
            source_id: source_id.to_string(),
            status,
            state: ObjectState::Pending,
            content: None,
            content_encoding: None,
            content_hash: None,
            record_id: None,
            current: false,
            metadata_modified: None,
            source_reference: None,
            created_at: Utc::now(),
        }
    }

    /// Attach already-retrieved content; the record skips the fetch stage.
    pub fn with_content(mut self, content: String, encoding: &str) -> Self {
        self.content_hash = Some(content_digest(&content));
        self.content = Some(content);
        self.content_encoding = Some(encoding.to_string());
        self.state = ObjectState::Fetched;
        self
    }

    pub fn with_record(mut self, record_id: Option<String>) -> Self {
        self.record_id = record_id;
        self
    }

    pub fn with_source_reference(mut self, reference: impl Into<String>) -> Self {
        self.source_reference = Some(reference.into());
        self
    }

    /// Whether the fetch stage still has to retrieve content for this record.
    pub fn needs_fetch(&self) -> bool {
        self.status != ObjectStatus::Delete
            && self.content.is_none()
            && self.state == ObjectState::Pending
    }
}

/// Pipeline stage an object error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorStage {
    Gather,
    Fetch,
    Import,
}

impl ErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gather => "Gather",
            Self::Fetch => "Fetch",
            Self::Import => "Import",
        }
    }
}

/// An error recorded against a single tracking record.
#[derive(Debug, Clone)]
pub struct ObjectError {
    pub object_id: String,
    pub guid: String,
    pub stage: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A job-level error recorded during gathering.
#[derive(Debug, Clone)]
pub struct GatherError {
    pub job_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Parsed documents
// ---------------------------------------------------------------------------

/// One value read from a metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    Records(Vec<BTreeMap<String, String>>),
}

/// Canonical field name -> value, read from one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParsedFields(pub BTreeMap<String, FieldValue>);

impl ParsedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: FieldValue) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Single text value; lists yield their first entry, anything missing yields "".
    pub fn text(&self, key: &str) -> &str {
        match self.0.get(key) {
            Some(FieldValue::Text(s)) => s,
            Some(FieldValue::List(items)) => items.first().map(String::as_str).unwrap_or(""),
            _ => "",
        }
    }

    /// List value; a single text value is promoted to a one-element list.
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(FieldValue::List(items)) => items.clone(),
            Some(FieldValue::Text(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Structured sub-records.
    pub fn records(&self, key: &str) -> &[BTreeMap<String, String>] {
        match self.0.get(key) {
            Some(FieldValue::Records(items)) => items,
            _ => &[],
        }
    }

    /// The value as JSON, for storing in a record's extension map.
    pub fn to_json(&self, key: &str) -> serde_json::Value {
        match self.0.get(key) {
            Some(FieldValue::Text(s)) => serde_json::Value::String(s.clone()),
            Some(value) => serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            None => serde_json::Value::String(String::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized records
// ---------------------------------------------------------------------------

/// Visibility state of a normalized record in the host store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Active,
    Deleted,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// A downloadable or viewable resource attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub protocol: String,
    pub function: String,
    /// Set when the capability probe affirmed a view service.
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_date: Option<DateTime<Utc>>,
    /// The resource to use for map previews, at most one per record.
    #[serde(default)]
    pub recommended_preview: bool,
}

/// The durable output entity ("package" in host terms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    /// URL-safe unique slug.
    pub name: String,
    pub title: String,
    pub notes: String,
    pub state: RecordState,
    pub tags: Vec<String>,
    pub resources: Vec<Resource>,
    /// Open key/value extension map carrying the harvested fields.
    pub extras: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl NormalizedRecord {
    /// String form of an extra, empty when missing or not a string.
    pub fn extra_str(&self, key: &str) -> &str {
        self.extras.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_parse() {
        assert_eq!("CSW".parse::<SourceKind>().unwrap(), SourceKind::Csw);
        assert_eq!("gemini-single".parse::<SourceKind>().unwrap(), SourceKind::Single);
        assert!("ftp".parse::<SourceKind>().is_err());
        assert!(SourceKind::Csw.computes_deletions());
        assert!(!SourceKind::Waf.computes_deletions());
    }

    #[test]
    fn object_state_transitions() {
        assert!(ObjectState::Pending.can_transition_to(ObjectState::Fetched));
        assert!(ObjectState::Fetched.can_transition_to(ObjectState::Imported));
        assert!(ObjectState::Fetched.can_transition_to(ObjectState::Errored));
        assert!(!ObjectState::Imported.can_transition_to(ObjectState::Pending));
        assert!(!ObjectState::Errored.can_transition_to(ObjectState::Imported));
    }

    #[test]
    fn tracking_record_with_content_skips_fetch() {
        let rec = TrackingRecord::new("guid-1", "job", "src", ObjectStatus::New);
        assert!(rec.needs_fetch());

        let rec = rec.with_content("<doc/>".into(), "utf-8");
        assert!(!rec.needs_fetch());
        assert_eq!(rec.state, ObjectState::Fetched);
        assert_eq!(rec.content_hash.as_deref(), Some(content_digest("<doc/>").as_str()));

        let del = TrackingRecord::new("guid-2", "job", "src", ObjectStatus::Delete);
        assert!(!del.needs_fetch());
    }

    #[test]
    fn parsed_fields_accessors() {
        let mut fields = ParsedFields::new();
        fields.insert("title", FieldValue::Text("Rivers".into()));
        fields.insert("tags", FieldValue::List(vec!["a".into(), "b".into()]));

        assert_eq!(fields.text("title"), "Rivers");
        assert_eq!(fields.text("missing"), "");
        assert_eq!(fields.list("tags"), vec!["a", "b"]);
        assert_eq!(fields.list("title"), vec!["Rivers"]);
        assert!(fields.records("tags").is_empty());
        assert_eq!(fields.to_json("tags"), serde_json::json!(["a", "b"]));
    }

    #[test]
    fn record_serialization() {
        let mut extras = BTreeMap::new();
        extras.insert("guid".to_string(), serde_json::json!("abc"));
        let record = NormalizedRecord {
            id: new_id(),
            name: "rivers".into(),
            title: "Rivers".into(),
            notes: String::new(),
            state: RecordState::Active,
            tags: vec!["water".into()],
            resources: vec![Resource {
                url: "http://x/wms".into(),
                ..Resource::default()
            }],
            extras,
            groups: vec![],
        };

        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: NormalizedRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, record);
        assert_eq!(parsed.extra_str("guid"), "abc");
    }
}
