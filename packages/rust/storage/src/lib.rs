//! libSQL storage layer (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding harvest sources,
//! jobs, tracking records ("harvest objects"), normalized records
//! ("packages"), gather/object errors and coupled-resource links.
//!
//! **Access rules:**
//! - harvest runs: read-write via [`Storage::open`]
//! - inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database, Row, params};
use tokio::sync::{Mutex, OwnedMutexGuard};

use geoharvest_shared::{
    GatherError, HarvestError, HarvestJob, HarvestSource, JobStats, JobStatus, NormalizedRecord,
    ObjectError, ObjectState, ObjectStatus, RecordState, Result, SourceConfig, SourceKind,
    TrackingRecord,
};

const METADATA_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const OBJECT_COLUMNS: &str = "id, guid, job_id, source_id, status, state, content, content_encoding, \
     content_hash, record_id, current, metadata_modified, source_reference, created_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes transactional units of work on the shared connection.
    tx_lock: Mutex<()>,
    /// One lock per identifier, shared by every import running on this handle.
    guid_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// How a commit changes the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Create,
    Update,
}

/// A service-to-dataset coupling row.
#[derive(Debug, Clone, PartialEq)]
pub struct CoupledResource {
    pub service_record_id: String,
    pub coupled_guid: String,
    /// Dataset record, once a current tracking record with that GUID exists.
    pub dataset_record_id: Option<String>,
}

/// The current tracking record for one identifier of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentObject {
    pub object_id: String,
    pub record_id: Option<String>,
}

fn db_err(e: libsql::Error) -> HarvestError {
    HarvestError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            tx_lock: Mutex::new(()),
            guid_locks: Mutex::new(HashMap::new()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarvestError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            tx_lock: Mutex::new(()),
            guid_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        HarvestError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Hold the import lock of `guid` until the guard is dropped.
    pub async fn lock_guid(&self, guid: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.guid_locks.lock().await;
            locks
                .entry(guid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(HarvestError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Register a new harvest source.
    pub async fn insert_source(&self, source: &HarvestSource) -> Result<()> {
        self.check_writable()?;
        let config = serde_json::to_string(&source.config)
            .map_err(|e| HarvestError::Storage(format!("cannot encode source config: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO sources (id, url, kind, config_json, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    source.id.as_str(),
                    source.url.as_str(),
                    source.kind.as_str(),
                    config,
                    source.active as i64,
                    source.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<HarvestSource>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, url, kind, config_json, active, created_at FROM sources WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_sources(&self) -> Result<Vec<HarvestSource>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, url, kind, config_json, active, created_at FROM sources ORDER BY created_at",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_source(&row)?);
        }
        Ok(results)
    }

    /// Enable or disable a source. Returns whether the source exists.
    pub async fn set_source_active(&self, id: &str, active: bool) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE sources SET active = ?1 WHERE id = ?2",
                params![active as i64, id],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub async fn insert_job(&self, job: &HarvestJob) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, source_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    job.id.as_str(),
                    job.source_id.as_str(),
                    job.status.as_str(),
                    job.started_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a job's final status and statistics.
    pub async fn finish_job(&self, job_id: &str, status: JobStatus, stats: &JobStats) -> Result<()> {
        self.check_writable()?;
        let stats_json = serde_json::to_string(stats)
            .map_err(|e| HarvestError::Storage(format!("cannot encode job stats: {e}")))?;
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, finished_at = ?2, stats_json = ?3 WHERE id = ?4",
                params![status.as_str(), Utc::now().to_rfc3339(), stats_json, job_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<HarvestJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, source_id, status, started_at, finished_at, stats_json FROM jobs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Jobs of a source, newest first.
    pub async fn list_jobs(&self, source_id: &str) -> Result<Vec<HarvestJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, source_id, status, started_at, finished_at, stats_json FROM jobs
                 WHERE source_id = ?1 ORDER BY started_at DESC",
                params![source_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Tracking records
    // -----------------------------------------------------------------------

    pub async fn insert_object(&self, object: &TrackingRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO harvest_objects ({OBJECT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    object.id.as_str(),
                    object.guid.as_str(),
                    object.job_id.as_str(),
                    object.source_id.as_str(),
                    object.status.as_str(),
                    object.state.as_str(),
                    object.content.as_deref(),
                    object.content_encoding.as_deref(),
                    object.content_hash.as_deref(),
                    object.record_id.as_deref(),
                    object.current as i64,
                    object
                        .metadata_modified
                        .map(|d| d.format(METADATA_DATE_FORMAT).to_string()),
                    object.source_reference.as_deref(),
                    object.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_object(&self, id: &str) -> Result<Option<TrackingRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {OBJECT_COLUMNS} FROM harvest_objects WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_object(&row)?)),
            None => Ok(None),
        }
    }

    /// Tracking records of one job, in creation order.
    pub async fn objects_for_job(&self, job_id: &str) -> Result<Vec<TrackingRecord>> {
        self.query_objects(
            &format!(
                "SELECT {OBJECT_COLUMNS} FROM harvest_objects WHERE job_id = ?1 ORDER BY created_at, id"
            ),
            job_id,
        )
        .await
    }

    /// Attach retrieved content; the record moves to `fetched`.
    pub async fn set_object_content(
        &self,
        id: &str,
        content: &str,
        encoding: &str,
        hash: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE harvest_objects
                 SET content = ?1, content_encoding = ?2, content_hash = ?3, state = ?4
                 WHERE id = ?5",
                params![content, encoding, hash, ObjectState::Fetched.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn set_object_state(&self, id: &str, state: ObjectState) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE harvest_objects SET state = ?1 WHERE id = ?2",
                params![state.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn set_metadata_modified(&self, id: &str, modified: NaiveDateTime) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE harvest_objects SET metadata_modified = ?1 WHERE id = ?2",
                params![modified.format(METADATA_DATE_FORMAT).to_string(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Current tracking records of a source, keyed by identifier.
    pub async fn current_objects_for_source(
        &self,
        source_id: &str,
    ) -> Result<HashMap<String, CurrentObject>> {
        let mut rows = self
            .conn
            .query(
                "SELECT guid, id, record_id FROM harvest_objects
                 WHERE source_id = ?1 AND current = 1",
                params![source_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = HashMap::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.insert(
                row.get::<String>(0).map_err(db_err)?,
                CurrentObject {
                    object_id: row.get::<String>(1).map_err(db_err)?,
                    record_id: row.get::<String>(2).ok(),
                },
            );
        }
        Ok(results)
    }

    /// Current tracking records for an identifier across all sources,
    /// excluding `exclude_id`.
    pub async fn current_objects_for_guid(
        &self,
        guid: &str,
        exclude_id: &str,
    ) -> Result<Vec<TrackingRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OBJECT_COLUMNS} FROM harvest_objects
                     WHERE guid = ?1 AND current = 1 AND id != ?2"
                ),
                params![guid, exclude_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_object(&row)?);
        }
        Ok(results)
    }

    /// Most recent tracking record of an identifier that wrote a record,
    /// current or not, excluding `exclude_id`.
    pub async fn latest_recorded_object_for_guid(
        &self,
        guid: &str,
        exclude_id: &str,
    ) -> Result<Option<TrackingRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OBJECT_COLUMNS} FROM harvest_objects
                     WHERE guid = ?1 AND id != ?2
                       AND record_id IS NOT NULL AND metadata_modified IS NOT NULL
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![guid, exclude_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_object(&row)?)),
            None => Ok(None),
        }
    }

    /// Current tracking record pointing at a record id.
    pub async fn current_object_for_record(&self, record_id: &str) -> Result<Option<TrackingRecord>> {
        let mut objects = self
            .query_objects(
                &format!(
                    "SELECT {OBJECT_COLUMNS} FROM harvest_objects WHERE record_id = ?1 AND current = 1"
                ),
                record_id,
            )
            .await?;
        Ok(objects.pop())
    }

    /// Clear the `current` flag of every tracking record for an identifier.
    pub async fn clear_current_for_guid(&self, guid: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE harvest_objects SET current = 0 WHERE guid = ?1 AND current = 1",
                params![guid],
            )
            .await
            .map_err(db_err)
    }

    async fn query_objects(&self, sql: &str, arg: &str) -> Result<Vec<TrackingRecord>> {
        let mut rows = self.conn.query(sql, params![arg]).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_object(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Import commit
    // -----------------------------------------------------------------------

    /// Write a record and hand "current" ownership to `object_id`, atomically.
    ///
    /// Every other tracking record pointing at the record, or carrying the
    /// same identifier, loses its `current` flag in the same transaction.
    pub async fn commit_import(
        &self,
        object_id: &str,
        guid: &str,
        record: &NormalizedRecord,
        kind: CommitKind,
    ) -> Result<()> {
        self.check_writable()?;
        let record_json = serde_json::to_string(record)
            .map_err(|e| HarvestError::Storage(format!("cannot encode record: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let _guard = self.tx_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        match kind {
            CommitKind::Create => {
                let mut owners = tx
                    .query(
                        "SELECT o.id FROM harvest_objects o JOIN packages p ON p.id = o.record_id
                         WHERE o.guid = ?1 AND o.current = 1 AND o.id != ?2",
                        params![guid, object_id],
                    )
                    .await
                    .map_err(db_err)?;
                if let Some(row) = owners.next().await.map_err(db_err)? {
                    let owner = row.get::<String>(0).map_err(db_err)?;
                    drop(owners);
                    tx.rollback().await.map_err(db_err)?;
                    return Err(HarvestError::Storage(format!(
                        "GUID {guid} already has a current record via object {owner}"
                    )));
                }
                drop(owners);

                tx.execute(
                    "INSERT INTO packages (id, name, title, state, record_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        record.id.as_str(),
                        record.name.as_str(),
                        record.title.as_str(),
                        record.state.as_str(),
                        record_json,
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
            }
            CommitKind::Update => {
                let changed = tx
                    .execute(
                        "UPDATE packages SET name = ?1, title = ?2, state = ?3, record_json = ?4, updated_at = ?5
                         WHERE id = ?6",
                        params![
                            record.name.as_str(),
                            record.title.as_str(),
                            record.state.as_str(),
                            record_json,
                            now.as_str(),
                            record.id.as_str(),
                        ],
                    )
                    .await
                    .map_err(db_err)?;
                if changed == 0 {
                    tx.rollback().await.map_err(db_err)?;
                    return Err(HarvestError::Storage(format!(
                        "record {} not found for update",
                        record.id
                    )));
                }
            }
        }

        tx.execute(
            "UPDATE harvest_objects SET current = 0
             WHERE (record_id = ?1 OR guid = ?2) AND id != ?3 AND current = 1",
            params![record.id.as_str(), guid, object_id],
        )
        .await
        .map_err(db_err)?;

        tx.execute(
            "UPDATE harvest_objects SET current = 1, record_id = ?1, state = ?2 WHERE id = ?3",
            params![record.id.as_str(), ObjectState::Imported.as_str(), object_id],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Mark a record deleted on behalf of a delete-tagged tracking record.
    pub async fn commit_delete(&self, object_id: &str, record_id: Option<&str>) -> Result<()> {
        self.check_writable()?;
        let _guard = self.tx_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        if let Some(record_id) = record_id {
            let mut record = match select_record(&tx, "id", record_id).await? {
                Some(record) => record,
                None => {
                    tx.rollback().await.map_err(db_err)?;
                    return Err(HarvestError::Storage(format!("record {record_id} not found")));
                }
            };
            record.state = RecordState::Deleted;
            let record_json = serde_json::to_string(&record)
                .map_err(|e| HarvestError::Storage(format!("cannot encode record: {e}")))?;
            tx.execute(
                "UPDATE packages SET state = ?1, record_json = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    RecordState::Deleted.as_str(),
                    record_json,
                    Utc::now().to_rfc3339(),
                    record_id,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.execute(
            "UPDATE harvest_objects SET current = 0, record_id = ?1, state = ?2 WHERE id = ?3",
            params![record_id, ObjectState::Imported.as_str(), object_id],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    pub async fn get_record(&self, id: &str) -> Result<Option<NormalizedRecord>> {
        select_record(&self.conn, "id", id).await
    }

    pub async fn get_record_by_name(&self, name: &str) -> Result<Option<NormalizedRecord>> {
        select_record(&self.conn, "name", name).await
    }

    /// Existing names starting with `prefix`.
    pub async fn names_like(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", escape_like(prefix));
        let mut rows = self
            .conn
            .query(
                "SELECT name FROM packages WHERE name LIKE ?1 ESCAPE '\\' ORDER BY name",
                params![pattern],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(results)
    }

    pub async fn list_records(&self) -> Result<Vec<NormalizedRecord>> {
        let mut rows = self
            .conn
            .query("SELECT record_json FROM packages ORDER BY name", params![])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(decode_record(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    pub async fn insert_gather_error(&self, job_id: &str, message: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO gather_errors (job_id, message, created_at) VALUES (?1, ?2, ?3)",
                params![job_id, message, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn insert_object_error(&self, object_id: &str, stage: &str, message: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO object_errors (object_id, stage, message, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![object_id, stage, message, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn gather_errors(&self, job_id: &str) -> Result<Vec<GatherError>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, message, created_at FROM gather_errors WHERE job_id = ?1 ORDER BY id",
                params![job_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(GatherError {
                job_id: row.get::<String>(0).map_err(db_err)?,
                message: row.get::<String>(1).map_err(db_err)?,
                created_at: parse_timestamp(&row.get::<String>(2).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    /// Object-level errors of every tracking record in a job.
    pub async fn object_errors(&self, job_id: &str) -> Result<Vec<ObjectError>> {
        let mut rows = self
            .conn
            .query(
                "SELECT e.object_id, o.guid, e.stage, e.message, e.created_at
                 FROM object_errors e JOIN harvest_objects o ON o.id = e.object_id
                 WHERE o.job_id = ?1 ORDER BY e.id",
                params![job_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(ObjectError {
                object_id: row.get::<String>(0).map_err(db_err)?,
                guid: row.get::<String>(1).map_err(db_err)?,
                stage: row.get::<String>(2).map_err(db_err)?,
                message: row.get::<String>(3).map_err(db_err)?,
                created_at: parse_timestamp(&row.get::<String>(4).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Coupled resources
    // -----------------------------------------------------------------------

    /// Replace the coupling rows of a service record.
    pub async fn replace_couplings(
        &self,
        service_record_id: &str,
        links: &[(String, Option<String>)],
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.tx_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "DELETE FROM coupled_resources WHERE service_record_id = ?1",
            params![service_record_id],
        )
        .await
        .map_err(db_err)?;

        for (guid, dataset_record_id) in links {
            tx.execute(
                "INSERT OR IGNORE INTO coupled_resources (service_record_id, coupled_guid, dataset_record_id)
                 VALUES (?1, ?2, ?3)",
                params![service_record_id, guid.as_str(), dataset_record_id.as_deref()],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Link waiting coupling rows for `guid` to a dataset record.
    pub async fn fill_couplings(&self, guid: &str, dataset_record_id: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE coupled_resources SET dataset_record_id = ?1
                 WHERE coupled_guid = ?2 AND (dataset_record_id IS NULL OR dataset_record_id != ?1)",
                params![dataset_record_id, guid],
            )
            .await
            .map_err(db_err)
    }

    pub async fn couplings_for_service(&self, service_record_id: &str) -> Result<Vec<CoupledResource>> {
        let mut rows = self
            .conn
            .query(
                "SELECT service_record_id, coupled_guid, dataset_record_id FROM coupled_resources
                 WHERE service_record_id = ?1 ORDER BY coupled_guid",
                params![service_record_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(CoupledResource {
                service_record_id: row.get::<String>(0).map_err(db_err)?,
                coupled_guid: row.get::<String>(1).map_err(db_err)?,
                dataset_record_id: row.get::<String>(2).ok(),
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

async fn select_record(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<NormalizedRecord>> {
    let mut rows = conn
        .query(
            &format!("SELECT record_json FROM packages WHERE {column} = ?1"),
            params![value],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(decode_record(&row)?)),
        None => Ok(None),
    }
}

fn decode_record(row: &Row) -> Result<NormalizedRecord> {
    let json = row.get::<String>(0).map_err(db_err)?;
    serde_json::from_str(&json)
        .map_err(|e| HarvestError::Storage(format!("corrupt record json: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarvestError::Storage(format!("invalid date: {e}")))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn row_to_source(row: &Row) -> Result<HarvestSource> {
    let kind: String = row.get(2).map_err(db_err)?;
    let config_json: Option<String> = row.get(3).ok();
    Ok(HarvestSource {
        id: row.get::<String>(0).map_err(db_err)?,
        url: row.get::<String>(1).map_err(db_err)?,
        kind: kind.parse::<SourceKind>()?,
        config: SourceConfig::from_json(config_json.as_deref())?,
        active: row.get::<i64>(4).map_err(db_err)? != 0,
        created_at: parse_timestamp(&row.get::<String>(5).map_err(db_err)?)?,
    })
}

fn row_to_job(row: &Row) -> Result<HarvestJob> {
    let status: String = row.get(2).map_err(db_err)?;
    let stats = match row.get::<String>(5).ok() {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| HarvestError::Storage(format!("corrupt job stats: {e}")))?,
        None => JobStats::default(),
    };
    Ok(HarvestJob {
        id: row.get::<String>(0).map_err(db_err)?,
        source_id: row.get::<String>(1).map_err(db_err)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| HarvestError::Storage(format!("unknown job status '{status}'")))?,
        started_at: parse_timestamp(&row.get::<String>(3).map_err(db_err)?)?,
        finished_at: match row.get::<String>(4).ok() {
            Some(s) => Some(parse_timestamp(&s)?),
            None => None,
        },
        stats,
    })
}

fn row_to_object(row: &Row) -> Result<TrackingRecord> {
    let status: String = row.get(4).map_err(db_err)?;
    let state: String = row.get(5).map_err(db_err)?;
    let metadata_modified = match row.get::<String>(11).ok() {
        Some(s) => Some(
            NaiveDateTime::parse_from_str(&s, METADATA_DATE_FORMAT)
                .map_err(|e| HarvestError::Storage(format!("invalid metadata date: {e}")))?,
        ),
        None => None,
    };
    Ok(TrackingRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        guid: row.get::<String>(1).map_err(db_err)?,
        job_id: row.get::<String>(2).map_err(db_err)?,
        source_id: row.get::<String>(3).map_err(db_err)?,
        status: ObjectStatus::parse(&status)
            .ok_or_else(|| HarvestError::Storage(format!("unknown object status '{status}'")))?,
        state: ObjectState::parse(&state)
            .ok_or_else(|| HarvestError::Storage(format!("unknown object state '{state}'")))?,
        content: row.get::<String>(6).ok(),
        content_encoding: row.get::<String>(7).ok(),
        content_hash: row.get::<String>(8).ok(),
        record_id: row.get::<String>(9).ok(),
        current: row.get::<i64>(10).map_err(db_err)? != 0,
        metadata_modified,
        source_reference: row.get::<String>(12).ok(),
        created_at: parse_timestamp(&row.get::<String>(13).map_err(db_err)?)?,
    })
}
