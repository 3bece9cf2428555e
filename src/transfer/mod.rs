//! Resumable chunk-transfer engine.
//!
//! The remote API serves a crawl's page table in numbered chunks of a
//! caller-chosen size. This module requests those chunks strictly in sequence,
//! appends their rows to an [`OutputSink`] and records progress in a
//! [`Checkpoint`] sidecar after every chunk, so a later run can pick up where
//! an interrupted one stopped.
//!
//! # Features
//!
//! - Resume arithmetic that maps rows already written onto a chunk address
//! - Fixed-delay retry for transport failures
//! - Status-code classification table (throttle, shrink, retry, fatal)
//! - Adaptive chunk-size shrink after repeated gateway timeouts
//! - Flush-before-checkpoint durability ordering
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crawl_export::transfer::{
//!     ChunkFetcher, EngineConfig, HttpTransport, SessionRequest, TransferEngine,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new("user", "secret")?);
//! let fetcher = ChunkFetcher::new(transport, 4242);
//! let engine = TransferEngine::new(fetcher, EngineConfig::default());
//! let request = SessionRequest::to_file("pages.tsv", true, true);
//! let session = engine.open_session(&request).await?;
//! let outcome = engine.run(session).await?;
//! println!("{} rows exported", outcome.total_elements);
//! # Ok(())
//! # }
//! ```

mod addressing;
pub mod checkpoint;
pub mod client;
mod constants;
pub mod engine;
mod error;
pub mod fetcher;
pub mod retry;
pub mod session;
pub mod sink;
pub mod status;

pub use addressing::ChunkAddress;
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, sidecar_path};
pub use client::{HttpTransport, Transport, TransportResponse};
pub use constants::{
    CHUNK_SHRINK_STEP, DEFAULT_API_BASE_URL, DEFAULT_CHUNK_SIZE, FETCH_RETRY_ATTEMPTS,
    FETCH_RETRY_DELAY, SIDECAR_SUFFIX, THROTTLE_PAUSE, TIMEOUT_SHRINK_THRESHOLD,
};
pub use engine::{EngineConfig, TransferEngine, TransferOutcome};
pub use error::{TransferError, TransportError};
pub use fetcher::{ChunkFetcher, ChunkKind};
pub use retry::{DelayStrategy, FatalKind, RetryPolicy, StatusClass, classify_status};
pub use session::{Session, SessionError, SessionRequest};
pub use sink::OutputSink;
pub use status::{StatusSnapshot, TransferPhase, TransferStatus, format_eta};
