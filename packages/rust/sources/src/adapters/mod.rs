//! Source adapters: discovery and retrieval strategies per source kind.
//!
//! Every adapter discovers `(identifier, optional content)` items for one
//! configured source and can retrieve a single document later. Failures for
//! individual items are collected in [`Discovery::failures`]; only a failure
//! to reach the source at all is returned as an error.

mod csw;
mod single;
mod waf;

use std::sync::Arc;

use async_trait::async_trait;

use geoharvest_gemini::{Decoded, decode_document, parse_text};
use geoharvest_shared::{HarvestError, HarvestSource, Result, SourceKind};

pub use csw::PagedQueryAdapter;
pub use single::SingleDocumentAdapter;
pub use waf::{DirectoryCrawlAdapter, extract_document_urls};

use crate::HttpFetcher;
use crate::csw::CswClient;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One identifier found during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredItem {
    /// Remote identifier (the document's GUID).
    pub guid: String,
    /// Protocol-specific locator used to retrieve the document.
    pub reference: String,
    /// Document content, when discovery already had to fetch it.
    pub content: Option<Decoded>,
}

/// A per-item discovery failure that did not abort the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryFailure {
    pub reference: String,
    pub message: String,
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub items: Vec<DiscoveredItem>,
    pub failures: Vec<DiscoveryFailure>,
}

impl Discovery {
    fn fail(&mut self, reference: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%reference, %message, "discovery item failed");
        self.failures.push(DiscoveryFailure {
            reference: reference.to_string(),
            message,
        });
    }
}

/// Discovery and retrieval capability of a harvest source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Enumerate the source's documents.
    async fn discover(&self) -> Result<Discovery>;

    /// Retrieve the raw bytes of one document.
    async fn retrieve(&self, guid: &str, reference: &str) -> Result<Vec<u8>>;
}

/// Build the adapter for a configured source.
pub fn adapter_for(
    source: &HarvestSource,
    fetcher: HttpFetcher,
    page_size: u32,
) -> Result<Arc<dyn SourceAdapter>> {
    Ok(match source.kind {
        SourceKind::Csw => {
            let client = CswClient::new(&source.url, fetcher.clone())?;
            Arc::new(PagedQueryAdapter::new(
                source.url.clone(),
                Arc::new(client),
                fetcher,
                source.config.clone(),
                page_size,
            ))
        }
        SourceKind::Waf => Arc::new(DirectoryCrawlAdapter::new(source.url.clone(), fetcher)),
        SourceKind::Single => Arc::new(SingleDocumentAdapter::new(source.url.clone(), fetcher)),
    })
}

/// Decode fetched bytes and read the document's GUID.
pub(crate) fn identify(raw: &[u8]) -> Result<(String, Decoded)> {
    let decoded = decode_document(raw)?;
    let fields = parse_text(&decoded.text)?;
    let guid = fields.text("guid").to_string();
    if guid.is_empty() {
        return Err(HarvestError::parse("document has no file identifier"));
    }
    Ok((guid, decoded))
}
