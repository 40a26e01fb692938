//! Fetch stage: retrieve content for tracking records that lack it.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use geoharvest_gemini::decode_document;
use geoharvest_shared::{
    ErrorStage, HarvestError, ObjectState, Result, TrackingRecord, content_digest,
};
use geoharvest_sources::SourceAdapter;
use geoharvest_storage::Storage;

use crate::pipeline::{CancelToken, ProgressReporter};

/// Counters from one fetch pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub errored: usize,
}

/// Fetch stage settings.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub concurrency: usize,
    /// Return the first retrieval error instead of recording it.
    pub debug_exceptions: bool,
}

/// Retrieve content for every record that needs it, updating `objects` in place.
///
/// Retrievals run concurrently up to `settings.concurrency`; writes happen on
/// the calling task. A failed retrieval is recorded against its tracking
/// record and the record moves to `errored`. Once `cancel` fires, queued
/// retrievals are not started. In debug mode the first failure aborts every
/// retrieval still in flight and is returned.
#[instrument(skip_all, fields(objects = objects.len()))]
pub async fn fetch_all(
    storage: &Storage,
    adapter: Arc<dyn SourceAdapter>,
    objects: &mut [TrackingRecord],
    settings: &FetchSettings,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> Result<FetchSummary> {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let pending: Vec<usize> = (0..objects.len())
        .filter(|&i| objects[i].needs_fetch())
        .collect();
    let total = pending.len();

    let mut handles = Vec::with_capacity(total);
    for &index in &pending {
        let object = &objects[index];
        let adapter = adapter.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let guid = object.guid.clone();
        let reference = object
            .source_reference
            .clone()
            .unwrap_or_else(|| object.guid.clone());

        handles.push((
            index,
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(adapter.retrieve(&guid, &reference).await)
            }),
        ));
    }

    let mut summary = FetchSummary::default();
    let mut handles = handles.into_iter().enumerate();
    while let Some((done, (index, handle))) = handles.next() {
        let object = &mut objects[index];
        let retrieved = match handle.await {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => Err(HarvestError::retrieval(
                object.source_reference.clone().unwrap_or_default(),
                format!("fetch task failed: {e}"),
            )),
        };

        match retrieved.and_then(|raw| decode_document(&raw)) {
            Ok(decoded) => {
                let hash = content_digest(&decoded.text);
                storage
                    .set_object_content(&object.id, &decoded.text, &decoded.encoding, &hash)
                    .await?;
                object.content = Some(decoded.text);
                object.content_encoding = Some(decoded.encoding);
                object.content_hash = Some(hash);
                object.state = ObjectState::Fetched;
                summary.fetched += 1;
                debug!(guid = %object.guid, "fetched");
            }
            Err(e) => {
                if settings.debug_exceptions {
                    handles.by_ref().for_each(|(_, (_, pending))| pending.abort());
                    return Err(e);
                }
                warn!(guid = %object.guid, error = %e, "fetch failed");
                storage
                    .insert_object_error(&object.id, ErrorStage::Fetch.as_str(), &e.to_string())
                    .await?;
                storage.set_object_state(&object.id, ObjectState::Errored).await?;
                object.state = ObjectState::Errored;
                summary.errored += 1;
            }
        }
        progress.object_fetched(&object.guid, done + 1, total);
    }

    info!(fetched = summary.fetched, errored = summary.errored, "fetch complete");
    Ok(summary)
}
