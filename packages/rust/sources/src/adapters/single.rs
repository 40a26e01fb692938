//! Single-document adapter: the source URL is the one document.

use async_trait::async_trait;
use tracing::instrument;

use geoharvest_shared::{HarvestError, Result, SourceKind};

use super::{DiscoveredItem, Discovery, SourceAdapter, identify};
use crate::HttpFetcher;

pub struct SingleDocumentAdapter {
    url: String,
    fetcher: HttpFetcher,
}

impl SingleDocumentAdapter {
    pub fn new(url: String, fetcher: HttpFetcher) -> Self {
        Self { url, fetcher }
    }
}

#[async_trait]
impl SourceAdapter for SingleDocumentAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Single
    }

    /// Fetch the document once; its GUID is read straight away.
    #[instrument(skip_all, fields(url = %self.url))]
    async fn discover(&self) -> Result<Discovery> {
        let raw = self
            .fetcher
            .get_bytes(&self.url)
            .await
            .map_err(|e| HarvestError::Gather(format!("Unable to get content for URL {}: {e}", self.url)))?;
        let (guid, decoded) = identify(&raw)
            .map_err(|e| HarvestError::Gather(format!("Could not read document at {}: {e}", self.url)))?;

        Ok(Discovery {
            items: vec![DiscoveredItem {
                guid,
                reference: self.url.clone(),
                content: Some(decoded),
            }],
            failures: Vec::new(),
        })
    }

    async fn retrieve(&self, _guid: &str, reference: &str) -> Result<Vec<u8>> {
        self.fetcher.get_bytes(reference).await
    }
}
