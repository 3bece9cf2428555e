//! Crawl Export Library
//!
//! This library downloads the page table of a finished crawl from the remote
//! crawl-data API, chunk by chunk, and appends it to a TSV file. Interrupted
//! exports resume from a checkpoint sidecar without re-fetching or duplicating
//! rows that were already written.
//!
//! # Architecture
//!
//! Everything lives under [`transfer`]:
//! - [`transfer::client`] - HTTP transport with transparent gzip decoding
//! - [`transfer::fetcher`] - chunk and total-count request builders
//! - [`transfer::retry`] - fixed-delay retry policy and status classification
//! - [`transfer::checkpoint`] - durable progress record next to the output file
//! - [`transfer::sink`] - buffered append-only row writer
//! - [`transfer::session`] - fresh, resumed or console session setup
//! - [`transfer::engine`] - the sequential chunk loop
//! - [`transfer::status`] - read-only counters polled by the progress display

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod transfer;
mod user_agent;

// Re-export commonly used types
pub use transfer::{
    Checkpoint, CheckpointStore, ChunkAddress, ChunkFetcher, DEFAULT_CHUNK_SIZE, DelayStrategy,
    EngineConfig, FatalKind, HttpTransport, OutputSink, RetryPolicy, Session, SessionError,
    SessionRequest, StatusClass, StatusSnapshot, TransferEngine, TransferError, TransferOutcome,
    TransferStatus, Transport, TransportError, TransportResponse, classify_status,
};
