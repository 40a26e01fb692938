//! Fixtures shared by the stage tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use geoharvest_gemini::Decoded;
use geoharvest_shared::{
    HarvestError, HarvestJob, HarvestSource, JobStats, JobStatus, NormalizedRecord, ObjectStatus,
    RecordState, Result, SourceConfig, SourceKind, TrackingRecord, new_id,
};
use geoharvest_sources::{DiscoveredItem, Discovery, DiscoveryFailure, SourceAdapter};
use geoharvest_storage::{CommitKind, Storage};

const DATASET_FIXTURE: &str = "../../../fixtures/xml/gemini_dataset.xml";
const FIXTURE_GUID: &str = "test-dataset-1";

/// The dataset fixture with its file identifier replaced by `guid`.
pub fn dataset_document(guid: &str) -> String {
    let raw = std::fs::read(DATASET_FIXTURE).unwrap();
    geoharvest_gemini::decode_document(&raw)
        .unwrap()
        .text
        .replace(FIXTURE_GUID, guid)
}

/// A temp-file database with one registered source.
pub struct TestEnv {
    pub storage: Storage,
    pub source: HarvestSource,
}

impl TestEnv {
    pub async fn new(kind: SourceKind) -> Self {
        let path = std::env::temp_dir().join(format!("gh_core_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&path).await.unwrap();
        let source = HarvestSource {
            id: new_id(),
            url: format!("http://example.com/{}/", kind.as_str()),
            kind,
            config: SourceConfig::default(),
            active: true,
            created_at: Utc::now(),
        };
        storage.insert_source(&source).await.unwrap();
        Self { storage, source }
    }

    /// Insert a running job and return its id.
    pub async fn job(&self) -> String {
        let job = HarvestJob {
            id: new_id(),
            source_id: self.source.id.clone(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            stats: JobStats::default(),
        };
        self.storage.insert_job(&job).await.unwrap();
        job.id
    }

    /// Store an imported, current tracking record for `guid` with its record.
    pub async fn current_object(&self, guid: &str, job_id: &str) -> TrackingRecord {
        let object = TrackingRecord::new(guid, job_id, &self.source.id, ObjectStatus::New)
            .with_content(dataset_document(guid), "utf-8");
        self.storage.insert_object(&object).await.unwrap();

        let record = NormalizedRecord {
            id: new_id(),
            name: format!("record-{}", guid.to_lowercase()),
            title: format!("Record {guid}"),
            notes: String::new(),
            state: RecordState::Active,
            tags: Vec::new(),
            resources: Vec::new(),
            extras: BTreeMap::new(),
            groups: Vec::new(),
        };
        self.storage
            .commit_import(&object.id, guid, &record, CommitKind::Create)
            .await
            .unwrap();
        self.storage.get_object(&object.id).await.unwrap().unwrap()
    }
}

/// In-memory adapter serving generated dataset documents.
pub struct ScriptedAdapter {
    kind: SourceKind,
    guids: Vec<String>,
    inline: bool,
    pub discovery_failures: Vec<(String, String)>,
    edit: fn(String) -> String,
    retrievals: AtomicUsize,
}

impl ScriptedAdapter {
    /// Discovery yields identifiers only; content comes from `retrieve`.
    pub fn with_ids(kind: SourceKind, guids: &[&str]) -> Self {
        Self::build(kind, guids, false)
    }

    /// Discovery carries each document's content.
    pub fn with_documents(kind: SourceKind, guids: &[&str]) -> Self {
        Self::build(kind, guids, true)
    }

    fn build(kind: SourceKind, guids: &[&str], inline: bool) -> Self {
        Self {
            kind,
            guids: guids.iter().map(|g| g.to_string()).collect(),
            inline,
            discovery_failures: Vec::new(),
            edit: |text| text,
            retrievals: AtomicUsize::new(0),
        }
    }

    /// Rewrite every served document with `edit`.
    pub fn map_documents(mut self, edit: fn(String) -> String) -> Self {
        self.edit = edit;
        self
    }

    fn document(&self, guid: &str) -> String {
        (self.edit)(dataset_document(guid))
    }

    /// Number of `retrieve` calls served so far.
    pub fn retrievals(&self) -> usize {
        self.retrievals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn discover(&self) -> Result<Discovery> {
        let items = self
            .guids
            .iter()
            .map(|guid| DiscoveredItem {
                guid: guid.clone(),
                reference: format!("http://example.com/{guid}.xml"),
                content: self.inline.then(|| Decoded {
                    text: self.document(guid),
                    encoding: "utf-8".to_string(),
                }),
            })
            .collect();
        let failures = self
            .discovery_failures
            .iter()
            .map(|(reference, message)| DiscoveryFailure {
                reference: reference.clone(),
                message: message.clone(),
            })
            .collect();
        Ok(Discovery { items, failures })
    }

    async fn retrieve(&self, guid: &str, reference: &str) -> Result<Vec<u8>> {
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        if self.guids.iter().any(|g| g == guid) {
            Ok(self.document(guid).into_bytes())
        } else {
            Err(HarvestError::Retrieval {
                url: reference.to_string(),
                status: Some(404),
                reason: "Not Found".to_string(),
            })
        }
    }
}
