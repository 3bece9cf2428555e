//! HTTP transport for the crawl-data API.
//!
//! The [`Transport`] trait is the only seam between the engine and the
//! network: one parameterized `GET`, raw bytes and status code back. Status
//! codes are never interpreted here.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_API_BASE_URL, READ_TIMEOUT_SECS};
use super::error::TransportError;
use crate::user_agent;

/// Raw outcome of a request that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decompressed response body.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Creates a response from a status code and body bytes.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Performs a single `GET` against the API.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Requests `path` with the given query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] only when no complete response was received;
    /// any status code the server sent is returned as `Ok`.
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed [`Transport`] that sends credentials with every request.
///
/// The client advertises gzip support and decodes gzip bodies based on the
/// response's `Content-Encoding`, so callers always see plain TSV or JSON.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a transport for the production API with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes
    /// - Gzip decompression: enabled
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Client`] if the HTTP client cannot be built.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, TransportError> {
        Self::with_base_url(DEFAULT_API_BASE_URL, username, password)
    }

    /// Creates a transport against an alternative API root (staging, mock server).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for an unparsable base URL and
    /// [`TransportError::Client`] if the HTTP client cannot be built.
    pub fn with_base_url(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, TransportError> {
        Self::with_timeouts(
            base_url,
            username,
            password,
            CONNECT_TIMEOUT_SECS,
            READ_TIMEOUT_SECS,
        )
    }

    /// Creates a transport with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Same as [`with_base_url`](Self::with_base_url).
    #[instrument(level = "debug", skip(username, password))]
    pub fn with_timeouts(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url).map_err(|_| TransportError::invalid_url(base_url))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self {
            client,
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    /// Returns the API root this transport talks to.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request_url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|_| TransportError::invalid_url(format!("{}{path}", self.base_url)))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(query.iter().map(|(key, value)| (*key, value.as_str())));
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(level = "debug", skip(self, query), fields(path = %path))]
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<TransportResponse, TransportError> {
        let url = self.request_url(path, query)?;
        debug!(url = %url, "sending request");

        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url.as_str(), e))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    url: url.to_string(),
                }
            } else {
                TransportError::body(url.as_str(), e)
            }
        })?;

        debug!(status, bytes = body.len(), "response received");
        Ok(TransportResponse::new(status, body.to_vec()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let transport = HttpTransport::new("alice", "hunter2").unwrap();
        let debug = format!("{transport:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"), "password leaked: {debug}");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let result = HttpTransport::with_base_url("not a url", "u", "p");
        assert!(matches!(result, Err(TransportError::InvalidUrl { .. })));
    }

    #[test]
    fn test_request_url_joins_path_and_query() {
        let transport = HttpTransport::with_base_url("https://api.example.com", "u", "p").unwrap();
        let url = transport
            .request_url(
                "/2.0/crawls/7/pages",
                &[("chunk", "3".to_string()), ("output", "tsv".to_string())],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/2.0/crawls/7/pages?chunk=3&output=tsv"
        );
    }

    #[tokio::test]
    async fn test_get_returns_status_without_interpreting_it() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.0/crawls/1/pages"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let transport = HttpTransport::with_base_url(&server.uri(), "u", "p").unwrap();
        let response = transport.get("/2.0/crawls/1/pages", &[]).await.unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.body, b"busy");
    }

    #[tokio::test]
    async fn test_get_sends_basic_auth_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.0/crawls/9/pages"))
            .and(query_param("deep", "1"))
            .and(query_param("chunk_size", "100"))
            // "alice:secret" base64-encoded
            .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::with_base_url(&server.uri(), "alice", "secret").unwrap();
        let response = transport
            .get(
                "/2.0/crawls/9/pages",
                &[("deep", "1".to_string()), ("chunk_size", "100".to_string())],
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_get_decompresses_gzip_body() {
        let plain = b"url\tstatus\nhttps://a.example/\t200\n";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(plain).unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.0/crawls/1/pages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Encoding", "gzip")
                    .set_body_bytes(compressed),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::with_base_url(&server.uri(), "u", "p").unwrap();
        let response = transport.get("/2.0/crawls/1/pages", &[]).await.unwrap();

        assert_eq!(response.body, plain);
    }

    #[tokio::test]
    async fn test_get_connection_refused_is_network_error() {
        // Bind and drop a listener to obtain a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport =
            HttpTransport::with_timeouts(&format!("http://127.0.0.1:{port}"), "u", "p", 2, 2)
                .unwrap();
        let result = transport.get("/2.0/crawls/1/pages", &[]).await;

        assert!(
            matches!(
                result,
                Err(TransportError::Network { .. } | TransportError::Timeout { .. })
            ),
            "expected transport error, got {result:?}"
        );
    }
}
