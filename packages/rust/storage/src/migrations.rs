//! SQL migration definitions for the GeoHarvest database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: sources, jobs, harvest_objects, packages, errors",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Configured harvest sources
CREATE TABLE IF NOT EXISTS sources (
    id          TEXT PRIMARY KEY,
    url         TEXT NOT NULL,
    kind        TEXT NOT NULL,
    config_json TEXT,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

-- Harvest job history
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    source_id   TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_source ON jobs(source_id);

-- Tracking records: one per identifier per job
CREATE TABLE IF NOT EXISTS harvest_objects (
    id                TEXT PRIMARY KEY,
    guid              TEXT NOT NULL,
    job_id            TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    source_id         TEXT NOT NULL,
    status            TEXT NOT NULL,
    state             TEXT NOT NULL,
    content           TEXT,
    content_encoding  TEXT,
    content_hash      TEXT,
    record_id         TEXT,
    current           INTEGER NOT NULL DEFAULT 0,
    metadata_modified TEXT,
    source_reference  TEXT,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_objects_guid_current ON harvest_objects(guid, current);
CREATE INDEX IF NOT EXISTS idx_objects_source_current ON harvest_objects(source_id, current);
CREATE INDEX IF NOT EXISTS idx_objects_job ON harvest_objects(job_id);
CREATE INDEX IF NOT EXISTS idx_objects_record ON harvest_objects(record_id);

-- Normalized records ("packages")
CREATE TABLE IF NOT EXISTS packages (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    title       TEXT NOT NULL,
    state       TEXT NOT NULL,
    record_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Job-level errors
CREATE TABLE IF NOT EXISTS gather_errors (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    message    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gather_errors_job ON gather_errors(job_id);

-- Object-level errors
CREATE TABLE IF NOT EXISTS object_errors (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    object_id  TEXT NOT NULL REFERENCES harvest_objects(id) ON DELETE CASCADE,
    stage      TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_object_errors_object ON object_errors(object_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Coupled resources between service and dataset records",
            sql: r#"
CREATE TABLE IF NOT EXISTS coupled_resources (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    service_record_id TEXT NOT NULL,
    coupled_guid      TEXT NOT NULL,
    dataset_record_id TEXT,
    UNIQUE(service_record_id, coupled_guid)
);

CREATE INDEX IF NOT EXISTS idx_coupled_guid ON coupled_resources(coupled_guid);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
