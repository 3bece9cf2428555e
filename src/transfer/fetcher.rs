//! Request builders for the crawl pages endpoint.
//!
//! Both request shapes hit `/2.0/crawls/{crawl}/pages`:
//! - data chunks: `deep`, `chunk`, `chunk_size`, `output=tsv`
//! - the one-time total-count probe: `deep=0`, `chunk=0`, `chunk_size=1`, `output=json`

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::addressing::ChunkAddress;
use super::client::{Transport, TransportResponse};
use super::error::{TransferError, TransportError};
use super::retry::{RetryPolicy, StatusClass, classify_status};
use super::status::TransferStatus;

/// Response format requested through the `output` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Tab-separated rows with a leading header row.
    Tsv,
    /// JSON envelope carrying pagination metadata.
    Json,
}

impl ChunkKind {
    /// Value of the `output` query parameter.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tsv => "tsv",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pagination envelope returned by `output=json`.
#[derive(Debug, Deserialize)]
struct ProbeEnvelope {
    chunk: ProbeChunk,
}

#[derive(Debug, Deserialize)]
struct ProbeChunk {
    total: u64,
    #[serde(default)]
    page: u64,
    #[serde(default)]
    size: u64,
}

/// Builds and sends chunk and probe requests for one crawl.
#[derive(Clone)]
pub struct ChunkFetcher {
    transport: Arc<dyn Transport>,
    crawl_id: u64,
}

impl fmt::Debug for ChunkFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkFetcher")
            .field("crawl_id", &self.crawl_id)
            .finish_non_exhaustive()
    }
}

impl ChunkFetcher {
    /// Creates a fetcher for `crawl_id` on top of `transport`.
    pub fn new(transport: Arc<dyn Transport>, crawl_id: u64) -> Self {
        Self {
            transport,
            crawl_id,
        }
    }

    /// Returns the crawl this fetcher downloads.
    #[must_use]
    pub fn crawl_id(&self) -> u64 {
        self.crawl_id
    }

    /// Endpoint path for this crawl's page table.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/2.0/crawls/{}/pages", self.crawl_id)
    }

    /// Query parameters for a TSV data chunk.
    #[must_use]
    pub fn chunk_query(
        address: ChunkAddress,
        chunk_size: u64,
        detail: bool,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("deep", if detail { "1" } else { "0" }.to_string()),
            ("chunk", address.index.to_string()),
            ("chunk_size", chunk_size.to_string()),
            ("output", ChunkKind::Tsv.to_string()),
        ]
    }

    /// Query parameters for the total-count probe.
    #[must_use]
    pub fn probe_query() -> Vec<(&'static str, String)> {
        vec![
            ("deep", "0".to_string()),
            ("chunk", "0".to_string()),
            ("chunk_size", "1".to_string()),
            ("output", ChunkKind::Json.to_string()),
        ]
    }

    /// Requests one data chunk. The status code is returned uninterpreted.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when no complete response was received.
    #[instrument(level = "debug", skip(self), fields(crawl = self.crawl_id))]
    pub async fn fetch_chunk(
        &self,
        address: ChunkAddress,
        chunk_size: u64,
        detail: bool,
    ) -> Result<TransportResponse, TransportError> {
        let query = Self::chunk_query(address, chunk_size, detail);
        self.transport.get(&self.path(), &query).await
    }

    /// Requests a chunk through `policy`, counting each failed attempt in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::TransportFatal`] once the attempt budget is spent.
    pub async fn fetch_chunk_with_retry(
        &self,
        address: ChunkAddress,
        chunk_size: u64,
        detail: bool,
        policy: &RetryPolicy,
        status: &TransferStatus,
    ) -> Result<TransportResponse, TransferError> {
        policy
            .run(
                move || self.fetch_chunk(address, chunk_size, detail),
                |_, _| status.record_error(),
            )
            .await
            .map_err(|(source, attempts)| TransferError::TransportFatal { attempts, source })
    }

    /// Asks the API how many rows the crawl's page table has.
    ///
    /// A status the classification table marks fatal (403, 404, other 4xx)
    /// aborts at once. Any other status except 200 counts as a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ClientFatal`] for a fatal status,
    /// [`TransferError::TransportFatal`] once the attempt budget is spent and
    /// [`TransferError::MalformedProbe`] if the body is not the expected JSON
    /// envelope.
    #[instrument(skip(self, policy, status), fields(crawl = self.crawl_id))]
    pub async fn probe_total(
        &self,
        policy: &RetryPolicy,
        status: &TransferStatus,
    ) -> Result<u64, TransferError> {
        let path = self.path();
        let query = Self::probe_query();
        let (path, query, transport) = (path.as_str(), query.as_slice(), &self.transport);
        let response = policy
            .run(
                move || async move {
                    let response = transport.get(path, query).await?;
                    if response.status == 200 || classify_status(response.status).is_fatal() {
                        Ok(response)
                    } else {
                        Err(TransportError::unexpected_status(path, response.status))
                    }
                },
                |_, _| status.record_error(),
            )
            .await
            .map_err(|(source, attempts)| TransferError::TransportFatal { attempts, source })?;

        if let StatusClass::Fatal(kind) = classify_status(response.status) {
            status.record_error();
            return Err(TransferError::ClientFatal {
                kind,
                status: response.status,
            });
        }
        let total = parse_total(&response.body).map_err(TransferError::MalformedProbe)?;
        info!(total, "total rows reported by API");
        Ok(total)
    }
}

/// Extracts `chunk.total` from a probe response body.
///
/// # Errors
///
/// Returns the JSON error if the body is not a valid envelope.
pub fn parse_total(body: &[u8]) -> Result<u64, serde_json::Error> {
    let envelope: ProbeEnvelope = serde_json::from_slice(body)?;
    debug!(
        total = envelope.chunk.total,
        page = envelope.chunk.page,
        size = envelope.chunk.size,
        "parsed probe envelope"
    );
    Ok(envelope.chunk.total)
}
