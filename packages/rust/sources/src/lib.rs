//! Harvest source adapters, HTTP transport, and the CSW catalogue client.
//!
//! This crate provides:
//! - [`SourceAdapter`]: discovery/retrieval per source kind (CSW, WAF, single document)
//! - [`CatalogService`] / [`CswClient`]: the paged catalogue contract and its HTTP client
//! - [`HttpFetcher`]: plain GET transport with timeout and error mapping
//! - [`ViewServiceProbe`]: WMS capability detection for resource previews

pub mod adapters;
pub mod csw;
pub mod probe;
pub mod transport;

pub use adapters::{
    DirectoryCrawlAdapter, DiscoveredItem, Discovery, DiscoveryFailure, PagedQueryAdapter,
    SingleDocumentAdapter, SourceAdapter, adapter_for, extract_document_urls,
};
pub use csw::{CatalogService, CswClient, IdentifierPage, RecordQuery};
pub use probe::{NoProbe, ViewServiceProbe, WmsProbe};
pub use transport::{HttpFetcher, encode_spaces};
