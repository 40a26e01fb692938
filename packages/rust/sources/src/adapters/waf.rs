//! Directory-crawl adapter: an index page whose links are sibling documents.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};

use geoharvest_shared::{HarvestError, Result, SourceKind};

use super::{DiscoveredItem, Discovery, SourceAdapter, identify};
use crate::HttpFetcher;

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector"));

pub struct DirectoryCrawlAdapter {
    url: String,
    fetcher: HttpFetcher,
}

impl DirectoryCrawlAdapter {
    pub fn new(url: String, fetcher: HttpFetcher) -> Self {
        Self { url, fetcher }
    }
}

#[async_trait]
impl SourceAdapter for DirectoryCrawlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Waf
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn discover(&self) -> Result<Discovery> {
        let index = self
            .fetcher
            .get_text(&self.url)
            .await
            .map_err(|e| HarvestError::Gather(format!("Unable to get content for URL {}: {e}", self.url)))?;

        let urls = extract_document_urls(&self.url, &index);
        debug!(links = urls.len(), "index page parsed");

        let mut discovery = Discovery::default();
        let mut seen = HashSet::new();
        for url in urls {
            let raw = match self.fetcher.get_bytes(&url).await {
                Ok(raw) => raw,
                Err(e) => {
                    discovery.fail(&url, e.to_string());
                    continue;
                }
            };
            match identify(&raw) {
                Ok((guid, decoded)) => {
                    if !seen.insert(guid.clone()) {
                        warn!(%guid, %url, "identifier already seen in this listing, skipping");
                        continue;
                    }
                    discovery.items.push(DiscoveredItem {
                        guid,
                        reference: url,
                        content: Some(decoded),
                    });
                }
                Err(e) => discovery.fail(&url, e.to_string()),
            }
        }

        info!(
            documents = discovery.items.len(),
            failures = discovery.failures.len(),
            "directory crawl complete"
        );
        Ok(discovery)
    }

    async fn retrieve(&self, _guid: &str, reference: &str) -> Result<Vec<u8>> {
        self.fetcher.get_bytes(reference).await
    }
}

/// Absolute URLs of the sibling documents linked from an index page.
///
/// Only bare filenames survive: links carrying a query, a path separator, a
/// fragment or a mail scheme are dropped, as is the index page itself.
pub fn extract_document_urls(index_url: &str, html: &str) -> Vec<String> {
    let base = directory_of(index_url);
    let doc = Html::parse_document(html);

    let mut seen = HashSet::new();
    doc.select(&LINK_SELECTOR)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| is_sibling_document(href))
        .filter(|href| seen.insert(href.to_string()))
        .map(|href| format!("{base}{href}"))
        .collect()
}

fn is_sibling_document(href: &str) -> bool {
    if href.is_empty() || href.starts_with("mailto:") {
        return false;
    }
    if href.contains(['?', '/', '#']) {
        return false;
    }
    let lower = href.to_ascii_lowercase();
    lower != "index" && !lower.starts_with("index.")
}

/// The directory of the index page, always ending in `/`.
fn directory_of(index_url: &str) -> String {
    let mut segments: Vec<&str> = index_url.trim().trim_end_matches('/').split('/').collect();
    if segments.last().is_some_and(|last| last.contains("index")) {
        segments.pop();
    }
    format!("{}/", segments.join("/"))
}
