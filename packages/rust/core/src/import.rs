//! Merge/import engine: turns a fetched tracking record into a written record.
//!
//! Per identifier the engine decides between create, update (possibly
//! reactivating a deleted record), skip and the fatal "same date, different
//! content" inconsistency. Imports of one identifier are serialized through
//! the store's per-GUID lock, so concurrent jobs on one store never both
//! create; the record write and the `current` flip share one transaction.

use std::sync::Arc;

use chrono::NaiveDateTime;
use similar::TextDiff;
use tracing::{debug, info, instrument, warn};

use geoharvest_gemini::{Validators, metadata_modified, parse_text};
use geoharvest_shared::{
    HarvestError, HarvestSource, NormalizedRecord, ObjectState, ObjectStatus, RecordState,
    Result, TrackingRecord, content_digest,
};
use geoharvest_sources::ViewServiceProbe;
use geoharvest_storage::{CommitKind, Storage};

use crate::coupling::sync_couplings;
use crate::naming::unique_name;
use crate::package::{RecordContext, build_record};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// What is known about the current tracking record of an identifier.
#[derive(Debug, Clone)]
pub struct PriorState {
    pub metadata_modified: Option<NaiveDateTime>,
    pub content_hash: Option<String>,
    /// Whether the source that harvested the prior record is still active.
    pub source_active: bool,
    /// Whether the record the prior points at is in the deleted state.
    pub record_deleted: bool,
}

/// Outcome of comparing a fetched document with the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Create,
    Update { reactivate: bool },
    Skip(String),
    /// Same metadata date, different bytes.
    Inconsistent,
}

/// Decide how to merge a document dated `modified` with hash `content_hash`.
pub fn decide(
    prior: Option<&PriorState>,
    modified: NaiveDateTime,
    content_hash: &str,
    force: bool,
) -> Decision {
    let Some(prior) = prior else {
        return Decision::Create;
    };

    let newer = prior.metadata_modified.is_none_or(|m| m < modified);
    let same_date = prior.metadata_modified == Some(modified);

    if newer || force || (same_date && !prior.source_active) {
        if prior.record_deleted {
            return if newer {
                Decision::Update { reactivate: true }
            } else {
                Decision::Skip("document is not more recent than the deleted record".into())
            };
        }
        return Decision::Update { reactivate: false };
    }

    if same_date && prior.content_hash.as_deref() != Some(content_hash) {
        return Decision::Inconsistent;
    }
    Decision::Skip("document unchanged".into())
}

/// Unified diff of two document versions.
pub fn content_diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .header("current", "incoming")
        .to_string()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// What importing one tracking record did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Created { record_id: String, name: String },
    Updated { record_id: String, name: String },
    Deleted { record_id: Option<String> },
    Skipped { reason: String },
}

/// Result of a successful import, with any non-fatal validation messages.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub outcome: ImportOutcome,
    pub warnings: Vec<String>,
}

/// Import policy knobs.
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub reject_invalid: bool,
    pub force_import: bool,
    pub max_name_attempts: u32,
}

/// Imports fetched tracking records of one source into the record store.
pub struct ImportEngine<'a> {
    storage: &'a Storage,
    validators: Validators,
    probe: Arc<dyn ViewServiceProbe>,
    settings: ImportSettings,
    publisher_id: Option<String>,
}

impl<'a> ImportEngine<'a> {
    pub fn new(
        storage: &'a Storage,
        source: &HarvestSource,
        validators: Validators,
        probe: Arc<dyn ViewServiceProbe>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            storage,
            validators,
            probe,
            settings,
            publisher_id: source.config.publisher_id.clone(),
        }
    }

    /// Import one tracking record.
    #[instrument(skip_all, fields(guid = %object.guid, object_id = %object.id))]
    pub async fn import(&self, object: &TrackingRecord) -> Result<ImportReport> {
        let _guard = self.storage.lock_guid(&object.guid).await;

        if object.status == ObjectStatus::Delete {
            self.storage
                .commit_delete(&object.id, object.record_id.as_deref())
                .await?;
            info!(record_id = ?object.record_id, "record deleted");
            return Ok(ImportReport {
                outcome: ImportOutcome::Deleted {
                    record_id: object.record_id.clone(),
                },
                warnings: Vec::new(),
            });
        }

        let content = object.content.as_deref().ok_or_else(|| HarvestError::NoContent {
            guid: object.guid.clone(),
        })?;
        let fields = parse_text(content)?;

        let (valid, messages) = self.validators.is_valid(content);
        let warnings = if valid {
            Vec::new()
        } else if self.settings.reject_invalid {
            return Err(HarvestError::validation(messages.join("\n")));
        } else {
            warn!(messages = messages.len(), "document failed validation, importing anyway");
            messages
        };

        let guid = match fields.text("guid") {
            "" => object.guid.as_str(),
            parsed => parsed,
        };
        let modified = metadata_modified(&fields)?;
        self.storage.set_metadata_modified(&object.id, modified).await?;

        let mut priors = self.storage.current_objects_for_guid(guid, &object.id).await?;
        if priors.len() > 1 {
            return Err(HarvestError::Storage(format!(
                "more than one current record for GUID {guid}"
            )));
        }
        let mut prior = priors.pop();
        let mut existing = match prior.as_ref().and_then(|p| p.record_id.as_deref()) {
            Some(record_id) => self.storage.get_record(record_id).await?,
            None => None,
        };

        let deleted = match prior {
            None => self.deleted_prior(guid, &object.id).await?,
            Some(_) => None,
        };
        if let Some((last, record)) = deleted {
            prior = Some(last);
            existing = Some(record);
        }

        let prior_state = match (&prior, &existing) {
            (Some(prior), Some(record)) => Some(PriorState {
                metadata_modified: prior.metadata_modified,
                content_hash: prior
                    .content_hash
                    .clone()
                    .or_else(|| prior.content.as_deref().map(content_digest)),
                source_active: self
                    .storage
                    .get_source(&prior.source_id)
                    .await?
                    .is_some_and(|s| s.active),
                record_deleted: record.state == RecordState::Deleted,
            }),
            _ => None,
        };

        let hash = object
            .content_hash
            .clone()
            .unwrap_or_else(|| content_digest(content));
        let decision = decide(
            prior_state.as_ref(),
            modified,
            &hash,
            self.settings.force_import,
        );
        debug!(?decision, "merge decision");

        let existing = match (decision, existing) {
            (Decision::Create, _) => None,
            (Decision::Update { reactivate }, Some(existing)) => {
                if reactivate {
                    info!(record_id = %existing.id, "reactivating deleted record");
                }
                Some(existing)
            }
            (Decision::Update { .. }, None) => None,
            (Decision::Skip(reason), _) => {
                info!(%reason, "skipping document");
                self.storage
                    .set_object_state(&object.id, ObjectState::Imported)
                    .await?;
                return Ok(ImportReport {
                    outcome: ImportOutcome::Skipped { reason },
                    warnings,
                });
            }
            (Decision::Inconsistent, _) => {
                let previous = prior.as_ref().and_then(|p| p.content.as_deref()).unwrap_or("");
                return Err(HarvestError::Inconsistency {
                    guid: guid.to_string(),
                    diff: content_diff(previous, content),
                });
            }
        };

        let source_reference = object.source_reference.as_deref().unwrap_or(guid);
        let ctx = RecordContext {
            object_id: &object.id,
            source_reference,
            publisher_id: self.publisher_id.as_deref(),
            metadata_modified: modified,
        };
        let mut record = build_record(&fields, &ctx, self.probe.as_ref()).await;

        let kind = match &existing {
            Some(existing) => {
                record.id = existing.id.clone();
                record.name = self.name_for_update(existing, &record, guid).await?;
                CommitKind::Update
            }
            None => {
                record.name = unique_name(
                    self.storage,
                    &record.title,
                    guid,
                    self.settings.max_name_attempts,
                )
                .await?;
                CommitKind::Create
            }
        };

        self.storage
            .commit_import(&object.id, guid, &record, kind)
            .await?;
        sync_couplings(self.storage, &fields, guid, &record.id).await?;

        let outcome = match kind {
            CommitKind::Create => {
                info!(record_id = %record.id, name = %record.name, "created record");
                ImportOutcome::Created {
                    record_id: record.id,
                    name: record.name,
                }
            }
            CommitKind::Update => {
                info!(record_id = %record.id, name = %record.name, "updated record");
                ImportOutcome::Updated {
                    record_id: record.id,
                    name: record.name,
                }
            }
        };
        Ok(ImportReport { outcome, warnings })
    }

    /// The last object that wrote `guid`'s record, when that record is deleted.
    ///
    /// Deletes leave no current tracking record behind, so the regular
    /// lookup cannot see them.
    async fn deleted_prior(
        &self,
        guid: &str,
        exclude_id: &str,
    ) -> Result<Option<(TrackingRecord, NormalizedRecord)>> {
        let Some(last) = self
            .storage
            .latest_recorded_object_for_guid(guid, exclude_id)
            .await?
        else {
            return Ok(None);
        };
        let record = match last.record_id.as_deref() {
            Some(record_id) => self.storage.get_record(record_id).await?,
            None => None,
        };
        Ok(record
            .filter(|r| r.state == RecordState::Deleted)
            .map(|record| (last, record)))
    }

    /// Keep the existing name unless the title changed.
    async fn name_for_update(
        &self,
        existing: &NormalizedRecord,
        record: &NormalizedRecord,
        guid: &str,
    ) -> Result<String> {
        if existing.title == record.title && !existing.name.is_empty() {
            return Ok(existing.name.clone());
        }
        unique_name(
            self.storage,
            &record.title,
            guid,
            self.settings.max_name_attempts,
        )
        .await
    }
}
