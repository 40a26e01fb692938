//! Plain HTTP GET transport shared by every adapter.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use geoharvest_shared::{HarvestError, Result};

/// User-Agent string for harvest requests.
const USER_AGENT: &str = concat!("GeoHarvest/", env!("CARGO_PKG_VERSION"));

/// Thin wrapper over a configured `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// GET `url` and return the body bytes. Non-2xx statuses are errors.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let url = encode_spaces(url);
        debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(&url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::Retrieval {
                url,
                status: Some(status.as_u16()),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(&url, &e))?;
        Ok(body.to_vec())
    }

    /// GET `url` and return the body as (lossy) UTF-8 text.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let bytes = self.get_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn request_error(url: &str, e: &reqwest::Error) -> HarvestError {
    let reason = if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    };
    HarvestError::Retrieval {
        url: url.to_string(),
        status: e.status().map(|s| s.as_u16()),
        reason,
    }
}

/// Percent-encode literal spaces, which some catalogues leave in links.
pub fn encode_spaces(url: &str) -> String {
    url.trim().replace(' ', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn spaces_are_encoded() {
        assert_eq!(
            encode_spaces(" http://example.com/my file.xml "),
            "http://example.com/my%20file.xml"
        );
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<a/>"))
            .mount(&server)
            .await;

        let body = fetcher()
            .get_text(&format!("{}/doc.xml", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "<a/>");
    }

    #[tokio::test]
    async fn non_success_status_carries_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher()
            .get_bytes(&format!("{}/missing.xml", server.uri()))
            .await
            .unwrap_err();
        match err {
            HarvestError::Retrieval { status, reason, .. } => {
                assert_eq!(status, Some(404));
                assert_eq!(reason, "Not Found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn spaces_in_path_are_requested_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/my%20file.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let body = fetcher()
            .get_text(&format!("{}/my file.xml", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn timeout_is_retrieval_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_millis(200)).unwrap();
        let err = fetcher.get_bytes(&server.uri()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Retrieval { status: None, .. }));
    }
}
