//! Harvest pipeline orchestration and merge logic for GeoHarvest.
//!
//! This crate ties source adapters, the document parser, and the record
//! store together into harvest jobs (`run_job` / `harvest_source`): gather
//! and reconcile identifiers, fetch content, then import each document into
//! a normalized record without losing its local identity.

pub mod coupling;
pub mod fetch;
pub mod gather;
pub mod import;
pub mod naming;
pub mod package;
pub mod pipeline;
pub mod reconcile;

#[cfg(test)]
mod testing;

pub use fetch::{FetchSettings, FetchSummary, fetch_all};
pub use gather::{GatherOutcome, gather};
pub use import::{ImportEngine, ImportOutcome, ImportReport, ImportSettings};
pub use pipeline::{
    CancelToken, JobResult, ProgressReporter, SilentProgress, harvest_source, run_job,
};
pub use reconcile::{Reconciliation, reconcile};
