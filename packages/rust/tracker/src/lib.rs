//! HTTP client for the findings-tracking service (DefectDojo API v2).
//!
//! Only two calls are needed: list every active finding, and replace one
//! finding by id.

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument};
use url::Url;

use epss_enrich_shared::{EnrichError, Payload, Result, TrackerConfig};

/// User-Agent string for tracker requests.
const USER_AGENT: &str = concat!("epss-enrich/", env!("CARGO_PKG_VERSION"));

/// Findings collection, relative to the tracker's base URL.
const FINDINGS_PATH: &str = "api/v2/findings/";

/// Client for the tracking service, built once from an immutable [`TrackerConfig`].
#[derive(Debug, Clone)]
pub struct TrackerClient {
    config: TrackerConfig,
    client: Client,
}

impl TrackerClient {
    /// Create a new client with the given configuration.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| EnrichError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// URL of the active-findings listing.
    pub fn listing_url(&self) -> Result<Url> {
        let mut url = self.join(FINDINGS_PATH)?;
        url.query_pairs_mut()
            .append_pair("active", "true")
            .append_pair("limit", &self.config.page_limit.to_string());
        Ok(url)
    }

    /// URL of one finding.
    pub fn finding_url(&self, id: i64) -> Result<Url> {
        self.join(&format!("{FINDINGS_PATH}{id}"))
    }

    /// Fetch every active finding and return the raw response body.
    ///
    /// Any transport failure or non-success status is a [`EnrichError::Network`].
    #[instrument(skip_all, fields(base = %self.config.base_url))]
    pub async fn list_active_findings(&self) -> Result<String> {
        let url = self.listing_url()?;

        let response = self
            .client
            .get(url.as_str())
            .header(AUTHORIZATION, self.config.token.as_str())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| EnrichError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnrichError::Network(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EnrichError::Network(format!("{url}: failed to read body: {e}")))?;

        info!(bytes = body.len(), "fetched active findings");
        Ok(body)
    }

    /// Replace finding `id` with `payload`.
    ///
    /// Returns the response status whether or not it indicates success; only a
    /// transport failure is an error here. Callers decide what a non-200 means.
    pub async fn update_finding(&self, id: i64, payload: &Payload) -> Result<StatusCode> {
        let url = self.finding_url(id)?;

        let response = self
            .client
            .put(url.as_str())
            .header(AUTHORIZATION, self.config.token.as_str())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| EnrichError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        debug!(id, %status, "update response");
        Ok(status)
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| EnrichError::config(format!("invalid tracker path '{path}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> TrackerClient {
        let config = TrackerConfig {
            base_url: Url::parse(&format!("{}/", server.uri())).unwrap(),
            token: "Token secret".into(),
            page_limit: 99_999_999,
            timeout: Duration::from_secs(5),
        };
        TrackerClient::new(config).unwrap()
    }

    #[test]
    fn urls_are_built_from_base() {
        let config = TrackerConfig {
            base_url: Url::parse("http://localhost:8080/").unwrap(),
            token: String::new(),
            page_limit: 500,
            timeout: Duration::from_secs(5),
        };
        let client = TrackerClient::new(config).unwrap();

        assert_eq!(
            client.listing_url().unwrap().as_str(),
            "http://localhost:8080/api/v2/findings/?active=true&limit=500"
        );
        assert_eq!(
            client.finding_url(42).unwrap().as_str(),
            "http://localhost:8080/api/v2/findings/42"
        );
    }

    #[tokio::test]
    async fn test_list_active_findings() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/findings/"))
            .and(query_param("active", "true"))
            .and(query_param("limit", "99999999"))
            .and(header("authorization", "Token secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"count":0,"results":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let body = client_for(&server).list_active_findings().await.unwrap();
        assert_eq!(body, r#"{"count":0,"results":[]}"#);
    }

    #[tokio::test]
    async fn test_list_unauthorized_is_network_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server).list_active_findings().await.unwrap_err();
        assert!(matches!(err, EnrichError::Network(_)));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_update_finding_sends_payload() {
        let server = MockServer::start().await;
        let payload = json!({"id": 10, "title": "openssl", "epss_score": "0.12345"});

        Mock::given(method("PUT"))
            .and(path("/api/v2/findings/10"))
            .and(header("authorization", "Token secret"))
            .and(header("content-type", "application/json"))
            .and(body_json(&payload))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let Some(object) = payload.as_object() else {
            panic!("payload is an object");
        };
        let status = client_for(&server).update_finding(10, object).await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_update_rejection_returns_status() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/api/v2/findings/11"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let status = client_for(&server)
            .update_finding(11, &Payload::new())
            .await
            .unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_connection_refused_is_network_error() {
        // Reserve a port, then close it so nothing is listening there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = TrackerConfig {
            base_url: Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap(),
            token: String::new(),
            page_limit: 1,
            timeout: Duration::from_secs(5),
        };
        let client = TrackerClient::new(config).unwrap();

        let err = client.update_finding(1, &Payload::new()).await.unwrap_err();
        assert!(matches!(err, EnrichError::Network(_)));
    }
}
