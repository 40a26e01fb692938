//! End-to-end harvest job: gather → fetch → import against one source.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, instrument, warn};

use geoharvest_gemini::Validators;
use geoharvest_shared::{
    ErrorStage, HarvestConfig, HarvestError, HarvestJob, HarvestSource, JobStats, JobStatus,
    ObjectState, Result, Severity, TrackingRecord, new_id,
};
use geoharvest_sources::{HttpFetcher, SourceAdapter, ViewServiceProbe, WmsProbe, adapter_for};
use geoharvest_storage::Storage;

use crate::fetch::{FetchSettings, fetch_all};
use crate::gather::gather;
use crate::import::{ImportEngine, ImportOutcome, ImportSettings};

// ---------------------------------------------------------------------------
// Cancellation and progress
// ---------------------------------------------------------------------------

/// Cancel handle shared between a running job and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one harvest job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub stats: JobStats,
    pub elapsed: Duration,
}

/// Progress callback for reporting job status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called when a document has been retrieved (or failed to be).
    fn object_fetched(&self, guid: &str, current: usize, total: usize);
    /// Called when a tracking record has been imported (or failed to be).
    fn object_imported(&self, guid: &str, current: usize, total: usize);
    /// Called when the job completes.
    fn done(&self, result: &JobResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn object_fetched(&self, _guid: &str, _current: usize, _total: usize) {}
    fn object_imported(&self, _guid: &str, _current: usize, _total: usize) {}
    fn done(&self, _result: &JobResult) {}
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

enum StageEnd {
    Completed,
    Aborted,
}

/// Harvest a stored source with the HTTP adapter for its kind.
pub async fn harvest_source(
    storage: &Storage,
    source_id: &str,
    config: &HarvestConfig,
    force: bool,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> Result<JobResult> {
    let source = storage
        .get_source(source_id)
        .await?
        .ok_or_else(|| HarvestError::config(format!("unknown harvest source '{source_id}'")))?;

    let fetcher = HttpFetcher::new(Duration::from_secs(config.timeout_secs))?;
    let adapter = adapter_for(&source, fetcher.clone(), config.page_size)?;
    let probe: Arc<dyn ViewServiceProbe> = Arc::new(WmsProbe::new(fetcher));

    run_job(storage, &source, adapter, probe, config, force, cancel, progress).await
}

/// Run one harvest job.
///
/// 1. Gather: discover and allocate tracking records
/// 2. Fetch: retrieve content for records that lack it
/// 3. Import: parse, validate and merge each record
///
/// Per-document failures are recorded and counted; the job still finishes.
/// A gather failure or cancellation finishes the job as `failed`. With
/// `debug_exceptions` set, the first error is returned after the job is closed.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(source = %source.url, kind = source.kind.as_str()))]
pub async fn run_job(
    storage: &Storage,
    source: &HarvestSource,
    adapter: Arc<dyn SourceAdapter>,
    probe: Arc<dyn ViewServiceProbe>,
    config: &HarvestConfig,
    force: bool,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> Result<JobResult> {
    let start = Instant::now();
    let validators = Validators::new(&config.profiles)?;

    let job = HarvestJob {
        id: new_id(),
        source_id: source.id.clone(),
        status: JobStatus::Running,
        started_at: Utc::now(),
        finished_at: None,
        stats: JobStats::default(),
    };
    storage.insert_job(&job).await?;
    info!(job_id = %job.id, "starting harvest job");

    let settings = ImportSettings {
        reject_invalid: config.reject_invalid,
        force_import: force || config.force_import || source.config.force_import,
        max_name_attempts: config.max_name_attempts,
    };
    let engine = ImportEngine::new(storage, source, validators, probe, settings);

    let mut stats = JobStats::default();
    let ended = run_stages(
        storage, source, &job.id, adapter, &engine, config, cancel, progress, &mut stats,
    )
    .await;

    let (status, raised) = match ended {
        Ok(StageEnd::Completed) => (JobStatus::Finished, None),
        Ok(StageEnd::Aborted) => {
            warn!(job_id = %job.id, "harvest job aborted");
            storage.insert_gather_error(&job.id, "aborted").await?;
            (JobStatus::Failed, None)
        }
        Err(e) => {
            let message = match &e {
                HarvestError::Gather(inner) => inner.clone(),
                other => other.to_string(),
            };
            warn!(job_id = %job.id, error = %message, "harvest job failed");
            storage.insert_gather_error(&job.id, &message).await?;
            // Document-level errors only escape the stages in debug mode.
            let raise = e.severity() == Severity::Object || matches!(e, HarvestError::Storage(_));
            (JobStatus::Failed, raise.then_some(e))
        }
    };

    storage.finish_job(&job.id, status, &stats).await?;
    if let Some(e) = raised {
        return Err(e);
    }

    let result = JobResult {
        job_id: job.id,
        status,
        stats,
        elapsed: start.elapsed(),
    };
    info!(
        job_id = %result.job_id,
        status = result.status.as_str(),
        created = result.stats.created,
        updated = result.stats.updated,
        deleted = result.stats.deleted,
        errored = result.stats.errored,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "harvest job complete"
    );
    progress.done(&result);
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
async fn run_stages(
    storage: &Storage,
    source: &HarvestSource,
    job_id: &str,
    adapter: Arc<dyn SourceAdapter>,
    engine: &ImportEngine<'_>,
    config: &HarvestConfig,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
    stats: &mut JobStats,
) -> Result<StageEnd> {
    // --- Gather ---
    progress.phase("Gathering identifiers");
    let mut objects = gather(storage, source, job_id, adapter.as_ref())
        .await?
        .objects;
    stats.gathered = objects.len();
    if cancel.is_cancelled() {
        return Ok(StageEnd::Aborted);
    }

    // --- Fetch ---
    progress.phase("Fetching documents");
    let inline = objects
        .iter()
        .filter(|o| o.state == ObjectState::Fetched)
        .count();
    let fetch = FetchSettings {
        concurrency: config.fetch_concurrency as usize,
        debug_exceptions: config.debug_exceptions,
    };
    let summary = fetch_all(storage, adapter, &mut objects, &fetch, cancel, progress).await?;
    stats.fetched = inline + summary.fetched;
    stats.errored += summary.errored;
    if cancel.is_cancelled() {
        return Ok(StageEnd::Aborted);
    }

    // --- Import ---
    progress.phase("Importing records");
    let ready: Vec<&TrackingRecord> = objects
        .iter()
        .filter(|o| o.state.can_transition_to(ObjectState::Imported))
        .collect();
    let total = ready.len();
    for (i, object) in ready.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(StageEnd::Aborted);
        }
        import_one(storage, engine, object, config.debug_exceptions, stats).await?;
        progress.object_imported(&object.guid, i + 1, total);
    }

    Ok(StageEnd::Completed)
}

async fn import_one(
    storage: &Storage,
    engine: &ImportEngine<'_>,
    object: &TrackingRecord,
    debug_exceptions: bool,
    stats: &mut JobStats,
) -> Result<()> {
    let stage = ErrorStage::Import.as_str();
    match engine.import(object).await {
        Ok(report) => {
            for warning in &report.warnings {
                storage.insert_object_error(&object.id, stage, warning).await?;
            }
            match report.outcome {
                ImportOutcome::Created { .. } => stats.created += 1,
                ImportOutcome::Updated { .. } => stats.updated += 1,
                ImportOutcome::Deleted { .. } => stats.deleted += 1,
                ImportOutcome::Skipped { .. } => stats.skipped += 1,
            }
        }
        Err(e) if debug_exceptions => return Err(e),
        Err(e) => {
            warn!(guid = %object.guid, error = %e, "import failed");
            storage.insert_object_error(&object.id, stage, &e.to_string()).await?;
            storage.set_object_state(&object.id, ObjectState::Errored).await?;
            stats.errored += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedAdapter, TestEnv, dataset_document};
    use geoharvest_shared::{RecordState, SourceConfig, SourceKind};
    use geoharvest_sources::NoProbe;
    use std::sync::Mutex;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> HarvestConfig {
        HarvestConfig {
            timeout_secs: 5,
            ..HarvestConfig::default()
        }
    }

    async fn run(env: &TestEnv, adapter: ScriptedAdapter, cancel: &CancelToken) -> JobResult {
        run_job(
            &env.storage,
            &env.source,
            Arc::new(adapter),
            Arc::new(NoProbe),
            &config(),
            false,
            cancel,
            &SilentProgress,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn csw_job_creates_then_skips_then_deletes() {
        let env = TestEnv::new(SourceKind::Csw).await;
        let cancel = CancelToken::default();

        let first = run(&env, ScriptedAdapter::with_ids(SourceKind::Csw, &["A", "B"]), &cancel).await;
        assert_eq!(first.status, JobStatus::Finished);
        assert_eq!(first.stats.gathered, 2);
        assert_eq!(first.stats.fetched, 2);
        assert_eq!(first.stats.created, 2);
        assert_eq!(env.storage.list_records().await.unwrap().len(), 2);

        // Same documents again: nothing new to write.
        let second = run(&env, ScriptedAdapter::with_ids(SourceKind::Csw, &["A", "B"]), &cancel).await;
        assert_eq!(second.stats.skipped, 2);
        assert_eq!(second.stats.created, 0);
        assert_eq!(env.storage.list_records().await.unwrap().len(), 2);

        // B disappeared remotely.
        let third = run(&env, ScriptedAdapter::with_ids(SourceKind::Csw, &["A"]), &cancel).await;
        assert_eq!(third.stats.deleted, 1);
        let records = env.storage.list_records().await.unwrap();
        let deleted = records.iter().filter(|r| r.state == RecordState::Deleted).count();
        assert_eq!(deleted, 1);
        assert!(env.storage.current_objects_for_guid("B", "").await.unwrap().is_empty());

        let stored = env.storage.get_job(&third.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Finished);
        assert_eq!(stored.stats, third.stats);
    }

    #[tokio::test]
    async fn reappearing_document_revives_its_deleted_record() {
        let env = TestEnv::new(SourceKind::Csw).await;
        let cancel = CancelToken::default();

        let first = run(&env, ScriptedAdapter::with_ids(SourceKind::Csw, &["A"]), &cancel).await;
        assert_eq!(first.stats.created, 1);
        let gone = run(&env, ScriptedAdapter::with_ids(SourceKind::Csw, &[]), &cancel).await;
        assert_eq!(gone.stats.deleted, 1);

        let adapter = ScriptedAdapter::with_ids(SourceKind::Csw, &["A"])
            .map_documents(|text| text.replace("2011-09-23T10:06:08", "2013-09-23T10:06:08"));
        let back = run(&env, adapter, &cancel).await;
        assert_eq!(back.status, JobStatus::Finished);
        assert_eq!(back.stats.created, 0);
        assert_eq!(back.stats.updated, 1);

        let records = env.storage.list_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, RecordState::Active);
        assert_eq!(records[0].name, "thames-flood-zones");
        let current = env.storage.current_objects_for_guid("A", "").await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].record_id.as_deref(), Some(records[0].id.as_str()));
    }

    #[tokio::test]
    async fn debug_mode_raises_first_import_error_after_failing_the_job() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let adapter = ScriptedAdapter::with_documents(SourceKind::Waf, &["U"])
            .map_documents(|text| text.replace("2011-09-23T10:06:08", "sometime in 2011"));
        let config = HarvestConfig {
            debug_exceptions: true,
            ..config()
        };

        let err = run_job(
            &env.storage,
            &env.source,
            Arc::new(adapter),
            Arc::new(NoProbe),
            &config,
            false,
            &CancelToken::default(),
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::MissingReferenceDate { .. }));

        let jobs = env.storage.list_jobs(&env.source.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].finished_at.is_some());
        let errors = env.storage.gather_errors(&jobs[0].id).await.unwrap();
        assert!(errors[0].message.contains("reference date"));
        assert!(env.storage.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn per_document_failures_do_not_fail_the_job() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let mut adapter = ScriptedAdapter::with_documents(SourceKind::Waf, &["A"]);
        adapter.discovery_failures = vec![("http://example.com/bad.xml".into(), "HTTP 500".into())];

        let result = run(&env, adapter, &CancelToken::default()).await;
        assert_eq!(result.status, JobStatus::Finished);
        assert_eq!(result.stats.created, 1);
        assert_eq!(env.storage.gather_errors(&result.job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_source_fails_the_job() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let result = run(&env, ScriptedAdapter::with_ids(SourceKind::Waf, &[]), &CancelToken::default()).await;

        assert_eq!(result.status, JobStatus::Failed);
        let errors = env.storage.gather_errors(&result.job_id).await.unwrap();
        assert!(errors[0].message.contains("no documents found"));
    }

    #[tokio::test]
    async fn cancelled_job_is_aborted() {
        let env = TestEnv::new(SourceKind::Csw).await;
        let cancel = CancelToken::default();
        cancel.cancel();
        let adapter = ScriptedAdapter::with_ids(SourceKind::Csw, &["A"]);

        let result = run(&env, adapter, &cancel).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.stats.fetched, 0);
        let errors = env.storage.gather_errors(&result.job_id).await.unwrap();
        assert_eq!(errors[0].message, "aborted");
        assert!(env.storage.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn validation_warnings_are_recorded() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let adapter = ScriptedAdapter::with_documents(SourceKind::Waf, &["W"]).map_documents(|text| {
            text.replace("<gmd:descriptiveKeywords>", "<gmd:other>")
                .replace("</gmd:descriptiveKeywords>", "</gmd:other>")
        });

        let result = run(&env, adapter, &CancelToken::default()).await;
        assert_eq!(result.stats.created, 1);
        let errors = env.storage.object_errors(&result.job_id).await.unwrap();
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.stage == "Import"));
        assert!(errors.iter().any(|e| e.message.contains("keyword")));
    }

    struct Recording(Mutex<Vec<String>>);

    impl ProgressReporter for Recording {
        fn phase(&self, name: &str) {
            self.0.lock().unwrap().push(name.to_string());
        }
        fn object_fetched(&self, _guid: &str, _current: usize, _total: usize) {}
        fn object_imported(&self, _guid: &str, _current: usize, _total: usize) {}
        fn done(&self, _result: &JobResult) {
            self.0.lock().unwrap().push("done".to_string());
        }
    }

    #[tokio::test]
    async fn harvests_waf_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/waf/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><a href="thames.xml">thames.xml</a></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/waf/thames.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(dataset_document("thames-1")))
            .mount(&server)
            .await;

        let db = std::env::temp_dir().join(format!("gh_pipeline_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&db).await.unwrap();
        let source = HarvestSource {
            id: new_id(),
            url: format!("{}/waf/", server.uri()),
            kind: SourceKind::Waf,
            config: SourceConfig::default(),
            active: true,
            created_at: Utc::now(),
        };
        storage.insert_source(&source).await.unwrap();

        let progress = Recording(Mutex::new(Vec::new()));
        let result = harvest_source(
            &storage,
            &source.id,
            &config(),
            false,
            &CancelToken::default(),
            &progress,
        )
        .await
        .unwrap();

        assert_eq!(result.status, JobStatus::Finished);
        assert_eq!(result.stats.created, 1);
        let record = storage.get_record_by_name("thames-flood-zones").await.unwrap().unwrap();
        assert_eq!(record.extra_str("guid"), "thames-1");
        assert_eq!(
            progress.0.lock().unwrap().last().map(String::as_str),
            Some("done")
        );

        // Second run over an unchanged directory leaves a single record.
        let again = harvest_source(
            &storage,
            &source.id,
            &config(),
            false,
            &CancelToken::default(),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(again.stats.skipped, 1);
        assert_eq!(storage.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_source_is_config_error() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let err = harvest_source(
            &env.storage,
            "nope",
            &config(),
            false,
            &CancelToken::default(),
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::Config { .. }));
    }
}
