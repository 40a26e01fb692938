//! Gather stage: discovery plus reconciliation into tracking records.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument, warn};

use geoharvest_shared::{
    HarvestError, HarvestSource, ObjectStatus, Result, TrackingRecord,
};
use geoharvest_sources::{DiscoveredItem, SourceAdapter};
use geoharvest_storage::Storage;

use crate::reconcile::reconcile;

/// Tracking records allocated by one gather pass.
#[derive(Debug, Default)]
pub struct GatherOutcome {
    pub objects: Vec<TrackingRecord>,
    /// Discovery items that failed without aborting the pass.
    pub failures: usize,
}

/// Discover the source and allocate one tracking record per identifier.
///
/// Sources that can be enumerated are diffed against the locally current
/// identifiers; identifiers gone from the remote side get a `delete` record
/// and lose their `current` flag straight away. Other sources produce `new`
/// records only. An empty batch is [`HarvestError::NoRecords`].
#[instrument(skip_all, fields(job_id = %job_id, source = %source.url))]
pub async fn gather(
    storage: &Storage,
    source: &HarvestSource,
    job_id: &str,
    adapter: &dyn SourceAdapter,
) -> Result<GatherOutcome> {
    let discovery = adapter.discover().await?;

    for failure in &discovery.failures {
        storage
            .insert_gather_error(job_id, &format!("{}: {}", failure.reference, failure.message))
            .await?;
    }

    let mut seen = HashSet::new();
    let items: Vec<DiscoveredItem> = discovery
        .items
        .into_iter()
        .filter(|item| {
            let first = seen.insert(item.guid.clone());
            if !first {
                warn!(guid = %item.guid, "identifier discovered twice, keeping the first");
            }
            first
        })
        .collect();

    let objects = if source.kind.computes_deletions() {
        diff_against_local(storage, source, job_id, items).await?
    } else {
        items
            .into_iter()
            .map(|item| allocate(item, job_id, &source.id, ObjectStatus::New, None))
            .collect()
    };

    if objects.is_empty() {
        return Err(HarvestError::NoRecords {
            message: format!("no documents found at {}", source.url),
        });
    }

    for object in &objects {
        storage.insert_object(object).await?;
    }

    info!(
        objects = objects.len(),
        failures = discovery.failures.len(),
        "gather complete"
    );
    Ok(GatherOutcome {
        objects,
        failures: discovery.failures.len(),
    })
}

async fn diff_against_local(
    storage: &Storage,
    source: &HarvestSource,
    job_id: &str,
    items: Vec<DiscoveredItem>,
) -> Result<Vec<TrackingRecord>> {
    let local = storage.current_objects_for_source(&source.id).await?;
    let remote: Vec<String> = items.iter().map(|i| i.guid.clone()).collect();
    let diff = reconcile(&remote, local.keys());
    debug!(
        new = diff.new.len(),
        change = diff.change.len(),
        delete = diff.delete.len(),
        "reconciled"
    );

    let change: HashSet<&str> = diff.change.iter().map(String::as_str).collect();
    let mut by_guid: HashMap<String, DiscoveredItem> =
        items.into_iter().map(|i| (i.guid.clone(), i)).collect();
    let mut objects = Vec::with_capacity(diff.len());

    for guid in diff.new.iter().chain(diff.change.iter()) {
        let Some(item) = by_guid.remove(guid) else {
            continue;
        };
        let (status, record_id) = if change.contains(guid.as_str()) {
            let record_id = local.get(guid).and_then(|c| c.record_id.clone());
            (ObjectStatus::Change, record_id)
        } else {
            (ObjectStatus::New, None)
        };
        objects.push(allocate(item, job_id, &source.id, status, record_id));
    }

    for guid in &diff.delete {
        let record_id = local.get(guid).and_then(|c| c.record_id.clone());
        storage.clear_current_for_guid(guid).await?;
        objects.push(
            TrackingRecord::new(guid, job_id, &source.id, ObjectStatus::Delete)
                .with_record(record_id),
        );
    }
    Ok(objects)
}

fn allocate(
    item: DiscoveredItem,
    job_id: &str,
    source_id: &str,
    status: ObjectStatus,
    record_id: Option<String>,
) -> TrackingRecord {
    let object = TrackingRecord::new(&item.guid, job_id, source_id, status)
        .with_source_reference(item.reference)
        .with_record(record_id);
    match item.content {
        Some(decoded) => object.with_content(decoded.text, &decoded.encoding),
        None => object,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedAdapter, TestEnv};
    use geoharvest_shared::{ObjectState, SourceKind};

    #[tokio::test]
    async fn csw_source_is_diffed_against_current_records() {
        let env = TestEnv::new(SourceKind::Csw).await;
        let job = env.job().await;
        for guid in ["B", "C", "D"] {
            env.current_object(guid, &job).await;
        }

        let adapter = ScriptedAdapter::with_ids(SourceKind::Csw, &["A", "B", "C"]);
        let next = env.job().await;
        let outcome = gather(&env.storage, &env.source, &next, &adapter).await.unwrap();

        let status_of = |guid: &str| {
            outcome
                .objects
                .iter()
                .find(|o| o.guid == guid)
                .map(|o| o.status)
        };
        assert_eq!(status_of("A"), Some(ObjectStatus::New));
        assert_eq!(status_of("B"), Some(ObjectStatus::Change));
        assert_eq!(status_of("C"), Some(ObjectStatus::Change));
        assert_eq!(status_of("D"), Some(ObjectStatus::Delete));

        // The deleted identifier lost its current flag during gather.
        assert!(env.storage.current_objects_for_guid("D", "").await.unwrap().is_empty());
        let delete = outcome.objects.iter().find(|o| o.guid == "D").unwrap();
        assert!(delete.record_id.is_some());
        assert_eq!(env.storage.objects_for_job(&next).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn waf_source_only_produces_new_records() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let job = env.job().await;
        env.current_object("B", &job).await;

        let adapter = ScriptedAdapter::with_documents(SourceKind::Waf, &["A", "B"]);
        let next = env.job().await;
        let outcome = gather(&env.storage, &env.source, &next, &adapter).await.unwrap();

        assert_eq!(outcome.objects.len(), 2);
        assert!(outcome.objects.iter().all(|o| o.status == ObjectStatus::New));
        assert!(outcome.objects.iter().all(|o| o.state == ObjectState::Fetched));
    }

    #[tokio::test]
    async fn empty_batch_is_no_records() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let job = env.job().await;
        let adapter = ScriptedAdapter::with_ids(SourceKind::Waf, &[]);
        let err = gather(&env.storage, &env.source, &job, &adapter).await.unwrap_err();
        assert!(matches!(err, HarvestError::NoRecords { .. }));
    }

    #[tokio::test]
    async fn discovery_failures_become_gather_errors() {
        let env = TestEnv::new(SourceKind::Waf).await;
        let job = env.job().await;
        let mut adapter = ScriptedAdapter::with_documents(SourceKind::Waf, &["A"]);
        adapter.discovery_failures = vec![("http://x/broken.xml".into(), "Not Found".into())];

        let outcome = gather(&env.storage, &env.source, &job, &adapter).await.unwrap();
        assert_eq!(outcome.failures, 1);
        let errors = env.storage.gather_errors(&job).await.unwrap();
        assert_eq!(errors[0].message, "http://x/broken.xml: Not Found");
    }

    #[tokio::test]
    async fn duplicate_identifiers_are_dropped() {
        let env = TestEnv::new(SourceKind::Csw).await;
        let job = env.job().await;
        let adapter = ScriptedAdapter::with_ids(SourceKind::Csw, &["A", "A"]);
        let outcome = gather(&env.storage, &env.source, &job, &adapter).await.unwrap();
        assert_eq!(outcome.objects.len(), 1);
    }
}
