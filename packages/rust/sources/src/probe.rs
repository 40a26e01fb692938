//! View-service capability probe used to tag preview-capable resources.

use async_trait::async_trait;
use tracing::debug;

use crate::HttpFetcher;

/// Answers whether a URL is a view (WMS) service endpoint.
///
/// Probe failures and ambiguous answers are `false`, never errors.
#[async_trait]
pub trait ViewServiceProbe: Send + Sync {
    async fn is_view_service(&self, url: &str) -> bool;
}

/// Probe that never affirms anything.
pub struct NoProbe;

#[async_trait]
impl ViewServiceProbe for NoProbe {
    async fn is_view_service(&self, _url: &str) -> bool {
        false
    }
}

/// Issues a WMS `GetCapabilities` request against the URL's base.
pub struct WmsProbe {
    fetcher: HttpFetcher,
}

impl WmsProbe {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ViewServiceProbe for WmsProbe {
    async fn is_view_service(&self, url: &str) -> bool {
        let base = url.split('?').next().unwrap_or(url);
        let capabilities = format!("{base}?service=WMS&request=GetCapabilities");
        let text = match self.fetcher.get_text(&capabilities).await {
            Ok(text) => text,
            Err(e) => {
                debug!(%url, error = %e, "WMS probe failed");
                return false;
            }
        };
        let Ok(doc) = roxmltree::Document::parse(&text) else {
            return false;
        };
        matches!(
            doc.root_element().tag_name().name(),
            "WMS_Capabilities" | "WMT_MS_Capabilities"
        )
    }
}
