//! Paged-query adapter over a CSW catalogue.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use geoharvest_gemini::{Decoded, decode_document, extract_all_metadata};
use geoharvest_shared::{HarvestError, Result, SourceConfig, SourceKind};

use super::{DiscoveredItem, Discovery, SourceAdapter, identify};
use crate::HttpFetcher;
use crate::csw::{CatalogService, RecordQuery};

/// Upper bound on pages requested in one discovery pass.
const MAX_PAGES: u32 = 100_000;

pub struct PagedQueryAdapter {
    url: String,
    catalog: Arc<dyn CatalogService>,
    fetcher: HttpFetcher,
    config: SourceConfig,
    page_size: u32,
}

impl PagedQueryAdapter {
    pub fn new(
        url: String,
        catalog: Arc<dyn CatalogService>,
        fetcher: HttpFetcher,
        config: SourceConfig,
        page_size: u32,
    ) -> Self {
        Self {
            url,
            catalog,
            fetcher,
            config,
            page_size: page_size.max(1),
        }
    }

    fn query(&self) -> RecordQuery {
        RecordQuery {
            cql: self.config.cql.clone(),
            sort_by: self.config.sort_by.clone(),
        }
    }

    /// Fetch the static batch, decoded per its XML declaration.
    async fn static_batch(&self) -> Result<Decoded> {
        let raw = self.fetcher.get_bytes(&self.url).await?;
        decode_document(&raw)
    }

    /// Parse the whole configured document once as a batch of records.
    async fn discover_static(&self) -> Result<Discovery> {
        let batch = self.static_batch().await.map_err(|e| match e {
            HarvestError::MalformedDocument { .. } => {
                HarvestError::Gather(format!("Error parsing the static document: {e}"))
            }
            other => HarvestError::Gather(format!("Error retrieving the static document: {other}")),
        })?;
        let documents = extract_all_metadata(&batch.text)
            .map_err(|e| HarvestError::Gather(format!("Error parsing the static document: {e}")))?;

        let mut discovery = Discovery::default();
        let mut seen = HashSet::new();
        for (index, document) in documents.into_iter().enumerate() {
            let reference = format!("{}#{}", self.url, index + 1);
            match identify(document.as_bytes()) {
                Ok((guid, decoded)) if seen.insert(guid.clone()) => {
                    discovery.items.push(DiscoveredItem {
                        guid,
                        reference: self.url.clone(),
                        content: Some(Decoded {
                            text: decoded.text,
                            encoding: batch.encoding.clone(),
                        }),
                    });
                }
                Ok((guid, _)) => warn!(%guid, "duplicate identifier in static document, skipping"),
                Err(e) => discovery.fail(&reference, e.to_string()),
            }
        }
        Ok(discovery)
    }
}

#[async_trait]
impl SourceAdapter for PagedQueryAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Csw
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn discover(&self) -> Result<Discovery> {
        if self.config.static_xml {
            return self.discover_static().await;
        }

        self.catalog
            .capabilities()
            .await
            .map_err(|e| HarvestError::Gather(format!("Error contacting the CSW server: {e}")))?;

        let query = self.query();
        let mut discovery = Discovery::default();
        let mut seen = HashSet::new();
        let mut start = 1;

        for _ in 0..MAX_PAGES {
            let page = self
                .catalog
                .identifiers_page(start, self.page_size, &query)
                .await
                .map_err(|e| {
                    HarvestError::Gather(format!(
                        "Error gathering the identifiers from the CSW server: {e}"
                    ))
                })?;

            for id in page.identifiers {
                let Some(guid) = id else {
                    warn!("CSW returned a record without an identifier, skipping");
                    continue;
                };
                if !seen.insert(guid.clone()) {
                    warn!(%guid, "CSW returned a duplicate identifier, skipping");
                    continue;
                }
                debug!(%guid, "discovered");
                discovery.items.push(DiscoveredItem {
                    reference: self.catalog.record_url(&guid),
                    guid,
                    content: None,
                });
            }

            match page.next {
                Some(next) if next > start => start = next,
                _ => break,
            }
        }

        info!(identifiers = discovery.items.len(), "CSW discovery complete");
        Ok(discovery)
    }

    async fn retrieve(&self, guid: &str, reference: &str) -> Result<Vec<u8>> {
        if self.config.static_xml {
            let batch = self.static_batch().await?;
            for document in extract_all_metadata(&batch.text)? {
                if let Ok((found, Decoded { text, .. })) = identify(document.as_bytes()) {
                    if found == guid {
                        return Ok(text.into_bytes());
                    }
                }
            }
            return Err(HarvestError::retrieval(
                reference,
                format!("Empty record for GUID {guid}"),
            ));
        }

        match self.catalog.record_by_id(guid).await? {
            Some(document) => Ok(document.into_bytes()),
            None => Err(HarvestError::retrieval(
                reference,
                format!("Empty record for GUID {guid}"),
            )),
        }
    }
}
