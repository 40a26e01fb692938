//! Client side of the CSW 2.0.2 catalogue protocol (KVP over HTTP GET).

use async_trait::async_trait;
use roxmltree::Node;
use tracing::{debug, instrument};
use url::Url;

use geoharvest_gemini::{extract_metadata, xpath};
use geoharvest_shared::{HarvestError, Result};

const CSW_VERSION: &str = "2.0.2";

/// Optional filtering and ordering for identifier discovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// CQL text constraint.
    pub cql: Option<String>,
    /// Sort key, e.g. `dc:identifier:A`.
    pub sort_by: Option<String>,
}

/// One page of identifiers plus the continuation token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentifierPage {
    /// Identifiers in catalogue order. Records without one appear as `None`.
    pub identifiers: Vec<Option<String>>,
    /// Start position of the next page, `None` when exhausted.
    pub next: Option<u32>,
}

/// The catalogue discovery contract consumed by the paged-query adapter.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Connectivity check. Returns the service title.
    async fn capabilities(&self) -> Result<String>;

    /// Identifiers starting at 1-based position `start`.
    async fn identifiers_page(
        &self,
        start: u32,
        page_size: u32,
        query: &RecordQuery,
    ) -> Result<IdentifierPage>;

    /// The `gmd:MD_Metadata` document for `id`, `None` when the catalogue
    /// answered with an empty result.
    async fn record_by_id(&self, id: &str) -> Result<Option<String>>;

    /// The locator used to retrieve `id`.
    fn record_url(&self, id: &str) -> String;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// CSW client over [`HttpFetcher`](crate::HttpFetcher).
pub struct CswClient {
    endpoint: Url,
    fetcher: crate::HttpFetcher,
}

impl CswClient {
    pub fn new(endpoint: &str, fetcher: crate::HttpFetcher) -> Result<Self> {
        let endpoint = Url::parse(endpoint.trim())
            .map_err(|e| HarvestError::config(format!("invalid CSW endpoint '{endpoint}': {e}")))?;
        Ok(Self { endpoint, fetcher })
    }

    fn request_url(&self, request: &str, params: &[(&str, &str)]) -> String {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("service", "CSW")
                .append_pair("version", CSW_VERSION)
                .append_pair("request", request);
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        url.to_string()
    }

    async fn get_document(&self, url: &str) -> Result<String> {
        let text = self.fetcher.get_text(url).await?;
        check_exception(url, &text)?;
        Ok(text)
    }
}

#[async_trait]
impl CatalogService for CswClient {
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn capabilities(&self) -> Result<String> {
        let url = self.request_url("GetCapabilities", &[]);
        let text = self.get_document(&url).await?;
        let doc = roxmltree::Document::parse(&text)
            .map_err(|e| HarvestError::retrieval(&url, format!("unparseable capabilities: {e}")))?;
        let root = doc.root_element();
        if root.tag_name().name() != "Capabilities" {
            return Err(HarvestError::retrieval(
                &url,
                format!("unexpected capabilities root <{}>", root.tag_name().name()),
            ));
        }
        Ok(xpath::first(root, "ows:ServiceIdentification/ows:Title"))
    }

    async fn identifiers_page(
        &self,
        start: u32,
        page_size: u32,
        query: &RecordQuery,
    ) -> Result<IdentifierPage> {
        let start_position = start.to_string();
        let max_records = page_size.to_string();
        let mut params = vec![
            ("typeNames", "gmd:MD_Metadata"),
            ("namespace", "xmlns(gmd=http://www.isotc211.org/2005/gmd)"),
            ("resultType", "results"),
            ("elementSetName", "brief"),
            ("outputSchema", xpath::GMD),
            ("startPosition", start_position.as_str()),
            ("maxRecords", max_records.as_str()),
        ];
        if let Some(cql) = query.cql.as_deref() {
            params.push(("constraintLanguage", "CQL_TEXT"));
            params.push(("constraint_language_version", "1.1.0"));
            params.push(("constraint", cql));
        }
        if let Some(sort_by) = query.sort_by.as_deref() {
            params.push(("sortBy", sort_by));
        }

        let url = self.request_url("GetRecords", &params);
        let text = self.get_document(&url).await?;
        let page = parse_records_page(&text)
            .map_err(|reason| HarvestError::retrieval(&url, reason))?;
        debug!(start, returned = page.identifiers.len(), next = ?page.next, "GetRecords page");
        Ok(page)
    }

    async fn record_by_id(&self, id: &str) -> Result<Option<String>> {
        let url = self.record_url(id);
        let text = self.get_document(&url).await?;
        let doc = roxmltree::Document::parse(&text)
            .map_err(|e| HarvestError::parse(format!("could not parse GetRecordById response: {e}")))?;
        if geoharvest_gemini::find_metadata(&doc).is_none() {
            return Ok(None);
        }
        extract_metadata(&text).map(Some)
    }

    fn record_url(&self, id: &str) -> String {
        self.request_url(
            "GetRecordById",
            &[
                ("id", id),
                ("elementSetName", "full"),
                ("outputSchema", xpath::GMD),
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Fail on an `ows:ExceptionReport` body.
fn check_exception(url: &str, text: &str) -> Result<()> {
    let Ok(doc) = roxmltree::Document::parse(text) else {
        return Ok(());
    };
    let root = doc.root_element();
    if root.tag_name().name() != "ExceptionReport" {
        return Ok(());
    }
    let exception = xpath::select_first(root, "ows:Exception");
    let code = exception
        .and_then(|e| e.attribute("exceptionCode"))
        .unwrap_or("unknown");
    let message = exception
        .map(|e| xpath::first(e, "ows:ExceptionText"))
        .unwrap_or_default();
    Err(HarvestError::retrieval(
        url,
        format!("catalogue exception {code}: {message}"),
    ))
}

fn parse_records_page(text: &str) -> std::result::Result<IdentifierPage, String> {
    let doc = roxmltree::Document::parse(text).map_err(|e| format!("unparseable GetRecords response: {e}"))?;
    let results = doc
        .root_element()
        .descendants()
        .find(|n| xpath::is_element(*n, "csw:SearchResults"))
        .ok_or_else(|| "GetRecords response has no csw:SearchResults".to_string())?;

    let identifiers: Vec<Option<String>> = results
        .children()
        .filter(Node::is_element)
        .map(|record| {
            let id = xpath::first_of(
                record,
                &["gmd:fileIdentifier/gco:CharacterString", "dc:identifier"],
            );
            (!id.is_empty()).then_some(id)
        })
        .collect();

    let attr = |name: &str| results.attribute(name).and_then(|v| v.trim().parse::<u32>().ok());
    let next = match (attr("nextRecord"), attr("numberOfRecordsMatched")) {
        (Some(0), _) | (None, _) => None,
        (Some(next), Some(matched)) if next > matched => None,
        _ if identifiers.is_empty() => None,
        (Some(next), _) => Some(next),
    };

    Ok(IdentifierPage { identifiers, next })
}
