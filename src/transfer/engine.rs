//! Sequential chunk-transfer loop.
//!
//! One iteration requests one chunk, classifies the response status, appends
//! the new rows, flushes the output and then persists the checkpoint. Only one
//! request is ever in flight because each address depends on the rows already
//! committed.
//!
//! Ordering invariant: the output is flushed and synced before the checkpoint
//! is saved, so the checkpoint never counts a row that is not on disk. A crash
//! between the two leaves the last chunk in the file uncounted; resuming
//! fetches that window again and appends it a second time. At most one chunk
//! is duplicated and no row is lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::addressing::ChunkAddress;
use super::checkpoint::{Checkpoint, CheckpointStore};
use super::constants::{
    CHUNK_SHRINK_STEP, DEFAULT_CHUNK_SIZE, THROTTLE_PAUSE, TIMEOUT_SHRINK_THRESHOLD,
};
use super::error::TransferError;
use super::fetcher::ChunkFetcher;
use super::retry::{RetryPolicy, StatusClass, classify_status};
use super::session::{Session, SessionError, SessionRequest};
use super::sink::OutputSink;
use super::status::{TransferPhase, TransferStatus};

/// Tunables of the transfer loop.
///
/// # Default Values
///
/// - `retry_policy`: 5 attempts, fixed 10 seconds
/// - `throttle_pause`: 30 seconds
/// - `initial_chunk_size`: 10000 rows
/// - `shrink_step`: 1000 rows
/// - `timeout_threshold`: 3 gateway timeouts
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempt budget for each request that fails below the HTTP level.
    pub retry_policy: RetryPolicy,
    /// Pause after a 429, 504 or other 5xx response.
    pub throttle_pause: Duration,
    /// Chunk size of a fresh export.
    pub initial_chunk_size: u64,
    /// Rows removed from the chunk size on each shrink.
    pub shrink_step: u64,
    /// Gateway timeouts that trigger a shrink.
    pub timeout_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            throttle_pause: THROTTLE_PAUSE,
            initial_chunk_size: DEFAULT_CHUNK_SIZE,
            shrink_step: CHUNK_SHRINK_STEP,
            timeout_threshold: TIMEOUT_SHRINK_THRESHOLD,
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Rows the crawl has.
    pub total_elements: u64,
    /// Data rows appended during this run (header excluded).
    pub rows_written: u64,
    /// Chunks that returned 200 and were committed.
    pub chunks_fetched: u64,
    /// Whether the run continued an earlier export.
    pub resumed: bool,
}

/// Drives a [`Session`] to completion.
#[derive(Debug)]
pub struct TransferEngine {
    fetcher: ChunkFetcher,
    config: EngineConfig,
    status: Arc<TransferStatus>,
}

impl TransferEngine {
    /// Creates an engine for `fetcher`'s crawl.
    #[must_use]
    pub fn new(fetcher: ChunkFetcher, config: EngineConfig) -> Self {
        Self {
            fetcher,
            config,
            status: Arc::new(TransferStatus::new()),
        }
    }

    /// Counters for the progress display.
    #[must_use]
    pub fn status(&self) -> Arc<TransferStatus> {
        Arc::clone(&self.status)
    }

    /// Opens a session with this engine's fetcher and configuration.
    ///
    /// # Errors
    ///
    /// See [`Session::open`].
    pub async fn open_session(&self, request: &SessionRequest) -> Result<Session, SessionError> {
        Session::open(request, &self.fetcher, &self.config, &self.status).await
    }

    /// Runs the transfer loop until every row is written or the session aborts.
    ///
    /// On any error the output and the sidecar are left as they were after the
    /// last committed chunk.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] for fatal client statuses, exhausted transport
    /// retries, malformed chunk bodies, and output or checkpoint I/O failures.
    #[instrument(skip(self, session), fields(crawl = self.fetcher.crawl_id()))]
    pub async fn run(&self, session: Session) -> Result<TransferOutcome, TransferError> {
        let Session {
            mut checkpoint,
            store,
            mut sink,
            resumed,
        } = session;

        let result = self
            .transfer(&mut checkpoint, store.as_ref(), &mut sink)
            .await;
        match result {
            Ok((rows_written, chunks_fetched)) => {
                self.status.set_phase(TransferPhase::Completed);
                info!(
                    output = sink.label(),
                    total = checkpoint.total_elements(),
                    rows_written,
                    chunks_fetched,
                    "download complete"
                );
                Ok(TransferOutcome {
                    total_elements: checkpoint.total_elements(),
                    rows_written,
                    chunks_fetched,
                    resumed,
                })
            }
            Err(e) => {
                self.status.set_phase(TransferPhase::Failed);
                error!(
                    error = %e,
                    output = sink.label(),
                    done = checkpoint.done_elements(),
                    "download aborted"
                );
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        checkpoint: &mut Checkpoint,
        store: Option<&CheckpointStore>,
        sink: &mut OutputSink,
    ) -> Result<(u64, u64), TransferError> {
        let detail = checkpoint.detail();
        let mut chunk_size = match checkpoint.chunk_size() {
            0 => self.config.initial_chunk_size.max(1),
            size => size,
        };
        let mut timeout_count: u32 = 0;
        let mut rows_written = 0;
        let mut chunks_fetched = 0;

        self.status
            .set_progress(checkpoint.done_elements(), checkpoint.total_elements());
        self.status.set_chunk_size(chunk_size);
        self.status.set_timeout_count(0);

        loop {
            if checkpoint.is_complete() {
                sink.flush().await.map_err(TransferError::Output)?;
                if let Some(store) = store {
                    store.remove()?;
                }
                return Ok((rows_written, chunks_fetched));
            }

            let done = checkpoint.done_elements();
            let remaining = checkpoint.remaining();
            if remaining < chunk_size {
                chunk_size = remaining;
                self.status.set_chunk_size(chunk_size);
            }
            checkpoint.set_chunk_size(chunk_size);

            let address = ChunkAddress::locate(done, chunk_size);
            debug!(
                chunk = address.index,
                skip = address.skip,
                chunk_size,
                done,
                "requesting chunk"
            );
            self.status.set_phase(TransferPhase::Fetching);
            let started = Instant::now();
            let response = self
                .fetcher
                .fetch_chunk_with_retry(
                    address,
                    chunk_size,
                    detail,
                    &self.config.retry_policy,
                    &self.status,
                )
                .await?;

            self.status.set_phase(TransferPhase::Classifying);
            match classify_status(response.status) {
                StatusClass::Proceed => {}
                StatusClass::Throttle => {
                    self.status.record_error();
                    warn!(status = response.status, "throttled by API, pausing");
                    self.pause().await;
                    continue;
                }
                StatusClass::Retry => {
                    self.status.record_error();
                    warn!(status = response.status, "server error, pausing before retry");
                    self.pause().await;
                    continue;
                }
                StatusClass::Shrink => {
                    self.status.record_error();
                    timeout_count += 1;
                    if timeout_count >= self.config.timeout_threshold {
                        let shrunk = chunk_size.saturating_sub(self.config.shrink_step).max(1);
                        warn!(from = chunk_size, to = shrunk, "repeated gateway timeouts, shrinking chunks");
                        chunk_size = shrunk;
                        checkpoint.set_chunk_size(chunk_size);
                        self.status.set_chunk_size(chunk_size);
                        timeout_count = 0;
                    } else {
                        warn!(timeout_count, "gateway timeout, pausing before retry");
                    }
                    self.status.set_timeout_count(timeout_count);
                    self.pause().await;
                    continue;
                }
                StatusClass::Fatal(kind) => {
                    self.status.record_error();
                    return Err(TransferError::ClientFatal {
                        kind,
                        status: response.status,
                    });
                }
            }

            let rows = select_rows(&response.body, address, done, remaining).inspect_err(|_| {
                self.status.record_error();
            })?;

            self.status.set_phase(TransferPhase::Writing);
            if let Some(header) = rows.header {
                sink.write_row(header).await.map_err(TransferError::Output)?;
            }
            for row in &rows.data {
                sink.write_row(row).await.map_err(TransferError::Output)?;
            }
            sink.flush().await.map_err(TransferError::Output)?;

            let added = rows.data.len() as u64;
            checkpoint.advance(added);
            self.status.set_phase(TransferPhase::Checkpointing);
            if let Some(store) = store {
                store.save(checkpoint)?;
            }

            rows_written += added;
            chunks_fetched += 1;
            self.status
                .set_progress(checkpoint.done_elements(), checkpoint.total_elements());
            self.status.record_chunk_rate(added, started.elapsed());
            debug!(
                chunk = address.index,
                added,
                done = checkpoint.done_elements(),
                "chunk committed"
            );
        }
    }

    async fn pause(&self) {
        self.status.set_phase(TransferPhase::Paused);
        if !self.config.throttle_pause.is_zero() {
            tokio::time::sleep(self.config.throttle_pause).await;
        }
    }
}

/// Rows of one chunk body that go into the output.
#[derive(Debug)]
struct ChunkRows<'a> {
    /// Header row, only for the first chunk of a file.
    header: Option<&'a [u8]>,
    /// New data rows.
    data: Vec<&'a [u8]>,
}

/// Splits a TSV body into lines, without terminators or a trailing empty line.
fn scan_rows(body: &[u8]) -> Vec<&[u8]> {
    let mut rows: Vec<&[u8]> = body
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();
    if rows.last().is_some_and(|last| last.is_empty()) {
        rows.pop();
    }
    rows
}

/// Picks the rows to append from a chunk body.
///
/// Every body starts with a header row. For the very first chunk the header is
/// kept and everything after it is data. Otherwise the first `address.skip`
/// rows (header plus rows already on disk) are dropped. The body is validated
/// in full before anything is written.
fn select_rows(
    body: &[u8],
    address: ChunkAddress,
    done: u64,
    remaining: u64,
) -> Result<ChunkRows<'_>, TransferError> {
    let rows = scan_rows(body);
    let malformed = |reason: String| TransferError::malformed_chunk(address.index, reason);

    let (header, start) = if done == 0 {
        let Some(header) = rows.first() else {
            return Err(malformed("first chunk has no header row".to_string()));
        };
        (Some(*header), 1)
    } else {
        let skip = usize::try_from(address.skip).unwrap_or(usize::MAX);
        if rows.len() < skip {
            return Err(malformed(format!(
                "expected at least {skip} rows to skip, got {}",
                rows.len()
            )));
        }
        (None, skip)
    };

    let data = rows[start..].to_vec();
    if data.is_empty() {
        return Err(malformed("no new rows".to_string()));
    }
    if data.len() as u64 > remaining {
        return Err(malformed(format!(
            "{} new rows but only {remaining} remaining",
            data.len()
        )));
    }
    Ok(ChunkRows { header, data })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::io::AsyncWrite;

    use super::*;
    use crate::transfer::client::{Transport, TransportResponse};
    use crate::transfer::error::TransportError;
    use crate::transfer::retry::{DelayStrategy, FatalKind};

    /// Serves a synthetic crawl of `total` rows. Scripted statuses are used
    /// for the first requests; a scripted 200 serves the chunk normally.
    struct FakeApi {
        total: u64,
        injected: Mutex<Vec<u16>>,
        requests: Mutex<Vec<(u64, u64)>>,
    }

    impl FakeApi {
        fn new(total: u64, mut injected: Vec<u16>) -> Arc<Self> {
            injected.reverse();
            Arc::new(Self {
                total,
                injected: Mutex::new(injected),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(u64, u64)> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn param(query: &[(&str, String)], key: &str) -> u64 {
        query
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.parse().unwrap())
            .unwrap()
    }

    #[async_trait]
    impl Transport for FakeApi {
        async fn get(
            &self,
            _path: &str,
            query: &[(&str, String)],
        ) -> Result<TransportResponse, TransportError> {
            let index = param(query, "chunk");
            let size = param(query, "chunk_size");
            self.requests.lock().unwrap().push((index, size));
            if let Some(status) = self.injected.lock().unwrap().pop()
                && status != 200
            {
                return Ok(TransportResponse::new(status, Vec::new()));
            }
            let mut body = String::from("url\tstatus\n");
            let end = ((index + 1) * size).min(self.total);
            for row in index * size..end {
                body.push_str(&format!("https://site.example/{row}\t200\n"));
            }
            Ok(TransportResponse::new(200, body))
        }
    }

    /// Writer whose contents stay readable after the sink is boxed.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl AsyncWrite for SharedBuffer {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn expected_output(total: u64) -> String {
        let mut text = String::from("url\tstatus\n");
        for row in 0..total {
            text.push_str(&format!("https://site.example/{row}\t200\n"));
        }
        text
    }

    fn engine(api: Arc<FakeApi>, chunk_size: u64) -> TransferEngine {
        let config = EngineConfig {
            retry_policy: RetryPolicy::new(5, DelayStrategy::Immediate),
            initial_chunk_size: chunk_size,
            ..EngineConfig::default()
        };
        TransferEngine::new(ChunkFetcher::new(api, 1), config)
    }

    fn console_session(total: u64, chunk_size: u64) -> (Session, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let sink = OutputSink::from_writer(buffer.clone(), "memory");
        let checkpoint = Checkpoint::new("", total, true, chunk_size);
        (Session::new(checkpoint, None, sink), buffer)
    }

    #[test]
    fn test_scan_rows_strips_terminators() {
        let rows = scan_rows(b"h\r\na\nb\n");
        assert_eq!(rows, vec![&b"h"[..], &b"a"[..], &b"b"[..]]);
        assert!(scan_rows(b"").is_empty());
    }

    #[test]
    fn test_select_rows_first_chunk_keeps_header() {
        let rows = select_rows(b"h\nr0\nr1\n", ChunkAddress::locate(0, 2), 0, 5).unwrap();
        assert_eq!(rows.header, Some(&b"h"[..]));
        assert_eq!(rows.data, vec![&b"r0"[..], &b"r1"[..]]);
    }

    #[test]
    fn test_select_rows_skips_header_and_duplicates() {
        // 3 rows done, chunk size 2 => chunk 1 holds r2, r3; r2 is on disk
        let address = ChunkAddress::locate(3, 2);
        let rows = select_rows(b"h\nr2\nr3\n", address, 3, 2).unwrap();
        assert!(rows.header.is_none());
        assert_eq!(rows.data, vec![&b"r3"[..]]);
    }

    #[test]
    fn test_select_rows_rejects_short_and_empty_bodies() {
        let address = ChunkAddress::locate(3, 2);
        assert!(matches!(
            select_rows(b"", address, 3, 2),
            Err(TransferError::MalformedChunk { chunk_index: 1, .. })
        ));
        assert!(select_rows(b"h\nr2\n", address, 3, 2).is_err());
        assert!(select_rows(b"", ChunkAddress::locate(0, 2), 0, 2).is_err());
    }

    #[test]
    fn test_select_rows_rejects_more_rows_than_remaining() {
        let result = select_rows(b"h\nr0\nr1\nr2\n", ChunkAddress::locate(0, 3), 0, 2);
        assert!(matches!(result, Err(TransferError::MalformedChunk { .. })));
    }

    #[tokio::test]
    async fn test_full_run_writes_header_once_and_all_rows() {
        let api = FakeApi::new(25, Vec::new());
        let engine = engine(api.clone(), 10);
        let (session, buffer) = console_session(25, 10);

        let outcome = engine.run(session).await.unwrap();

        assert_eq!(buffer.text(), expected_output(25));
        assert_eq!(outcome.rows_written, 25);
        assert_eq!(outcome.chunks_fetched, 3);
        assert_eq!(engine.status().phase(), TransferPhase::Completed);
    }

    #[tokio::test]
    async fn test_final_chunk_is_clamped_to_remaining() {
        let api = FakeApi::new(25_000, Vec::new());
        let engine = engine(api.clone(), 10_000);
        let (session, buffer) = console_session(25_000, 10_000);

        engine.run(session).await.unwrap();

        // The third request addresses row 20000 at the clamped size.
        assert_eq!(
            api.requests(),
            vec![(0, 10_000), (1, 10_000), (4, 5_000)]
        );
        assert_eq!(buffer.text(), expected_output(25_000));
        assert_eq!(engine.status().chunk_size(), 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_pauses_once_and_repeats_request() {
        let api = FakeApi::new(4, vec![429]);
        let engine = engine(api.clone(), 10);
        let (session, buffer) = console_session(4, 10);

        let started = tokio::time::Instant::now();
        engine.run(session).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
        assert_eq!(api.requests(), vec![(0, 4), (0, 4)]);
        assert_eq!(buffer.text(), expected_output(4));
        assert_eq!(engine.status().timeout_count(), 0);
        assert_eq!(engine.status().error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_gateway_timeouts_shrink_once() {
        let api = FakeApi::new(10_000, vec![504, 504, 504, 504]);
        let engine = engine(api.clone(), 5_000);
        let (session, buffer) = console_session(10_000, 5_000);

        engine.run(session).await.unwrap();

        let requests = api.requests();
        let sizes: Vec<u64> = requests.iter().map(|(_, size)| *size).collect();
        // Fourth 504 arrives right after the reset and must not shrink again.
        assert_eq!(&sizes[..5], &[5_000, 5_000, 5_000, 4_000, 4_000]);
        assert_eq!(engine.status().timeout_count(), 1);
        assert_eq!(buffer.text(), expected_output(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_server_errors_retry_without_shrink() {
        let api = FakeApi::new(3, vec![500, 503]);
        let engine = engine(api.clone(), 10);
        let (session, _buffer) = console_session(3, 10);

        engine.run(session).await.unwrap();

        assert_eq!(api.requests(), vec![(0, 3), (0, 3), (0, 3)]);
        assert_eq!(engine.status().timeout_count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_status_preserves_durable_state() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("pages.tsv");
        std::fs::write(&output, "url\tstatus\nhttps://site.example/0\t200\n").unwrap();
        let store = CheckpointStore::for_output(&output);
        let mut checkpoint = Checkpoint::new(output.to_string_lossy(), 5, true, 2);
        checkpoint.advance(1);
        store.save(&checkpoint).unwrap();
        let sidecar_before = std::fs::read(store.path()).unwrap();

        let api = FakeApi::new(5, vec![403]);
        let engine = engine(api, 2);
        let sink = OutputSink::append_file(&output).await.unwrap();
        let error = engine
            .run(Session::new(checkpoint, Some(store.clone()), sink))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            TransferError::ClientFatal {
                kind: FatalKind::AccessDenied,
                status: 403
            }
        ));
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "url\tstatus\nhttps://site.example/0\t200\n"
        );
        assert_eq!(std::fs::read(store.path()).unwrap(), sidecar_before);
        assert_eq!(engine.status().phase(), TransferPhase::Failed);
    }

    #[tokio::test]
    async fn test_complete_at_entry_removes_sidecar_without_requests() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("pages.tsv");
        std::fs::write(&output, "url\n").unwrap();
        let store = CheckpointStore::for_output(&output);
        let mut checkpoint = Checkpoint::new(output.to_string_lossy(), 2, true, 10);
        checkpoint.advance(2);
        store.save(&checkpoint).unwrap();

        let api = FakeApi::new(2, Vec::new());
        let engine = engine(api.clone(), 10);
        let sink = OutputSink::append_file(&output).await.unwrap();
        let outcome = engine
            .run(Session::new(checkpoint, Some(store.clone()), sink))
            .await
            .unwrap();

        assert!(api.requests().is_empty());
        assert!(!store.exists());
        assert_eq!(outcome.rows_written, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_tracks_each_committed_chunk() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("pages.tsv");
        let store = CheckpointStore::for_output(&output);
        let checkpoint = Checkpoint::new(output.to_string_lossy(), 6, true, 4);
        store.save(&checkpoint).unwrap();

        // First chunk succeeds, the second is refused.
        let api = FakeApi::new(6, vec![200, 404]);
        let engine = engine(api, 4);
        let sink = OutputSink::create_file(&output).await.unwrap();
        let error = engine
            .run(Session::new(checkpoint, Some(store.clone()), sink))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            TransferError::ClientFatal {
                kind: FatalKind::NotFound,
                ..
            }
        ));
        let saved = store.load().unwrap();
        assert_eq!(saved.done_elements(), 4);
        assert_eq!(saved.chunk_size(), 4);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), expected_output(4));
    }

    #[tokio::test]
    async fn test_uncommitted_chunk_is_appended_again_on_resume() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("pages.tsv");
        // Rows 2 and 3 reached the file but the checkpoint was not saved.
        std::fs::write(&output, expected_output(4)).unwrap();
        let store = CheckpointStore::for_output(&output);
        let mut checkpoint = Checkpoint::new(output.to_string_lossy(), 5, true, 2);
        checkpoint.advance(2);
        store.save(&checkpoint).unwrap();

        let api = FakeApi::new(5, Vec::new());
        let engine = engine(api.clone(), 2);
        let sink = OutputSink::append_file(&output).await.unwrap();
        let outcome = engine
            .run(Session::new(checkpoint, Some(store.clone()), sink))
            .await
            .unwrap();

        assert_eq!(api.requests(), vec![(1, 2), (2, 2)]);
        assert_eq!(outcome.rows_written, 3);
        let mut expected = expected_output(4);
        for row in 2..5 {
            expected.push_str(&format!("https://site.example/{row}\t200\n"));
        }
        assert_eq!(std::fs::read_to_string(&output).unwrap(), expected);
        assert!(!store.exists());
    }
}
