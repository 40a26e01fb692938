//! Shared types, error model, and configuration for GeoHarvest.
//!
//! This crate is the foundation depended on by all other GeoHarvest crates.
//! It provides:
//! - [`HarvestError`]: the unified error type
//! - Domain types ([`TrackingRecord`], [`NormalizedRecord`], [`ParsedFields`], ...)
//! - Configuration ([`AppConfig`], [`HarvestConfig`], [`SourceConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEBUG_ENV_VAR, HarvestConfig, HarvestDefaults, SourceConfig, StorageConfig,
    ValidationConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_path,
};
pub use error::{HarvestError, Result, Severity};
pub use types::{
    ErrorStage, FieldValue, GatherError, HarvestJob, HarvestSource, JobStats, JobStatus,
    NormalizedRecord, ObjectError, ObjectState, ObjectStatus, ParsedFields, RecordState, Resource,
    SourceKind, TrackingRecord, content_digest, new_id,
};
