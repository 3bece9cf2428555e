//! Constants for the transfer module (endpoint, timeouts, chunk policy).

use std::time::Duration;

/// Base URL of the crawl-data API.
pub const DEFAULT_API_BASE_URL: &str = "https://api.audisto.com";

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes; large chunks can be slow to render).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Rows requested per chunk at the start of a new export.
pub const DEFAULT_CHUNK_SIZE: u64 = 10_000;

/// Rows removed from the chunk size after repeated gateway timeouts.
pub const CHUNK_SHRINK_STEP: u64 = 1_000;

/// Number of 504 responses that triggers a chunk-size shrink.
pub const TIMEOUT_SHRINK_THRESHOLD: u32 = 3;

/// Pause after a throttled (429) or server-error (5xx) response.
pub const THROTTLE_PAUSE: Duration = Duration::from_secs(30);

/// Attempts per request (including the first) before a transport failure is fatal.
pub const FETCH_RETRY_ATTEMPTS: u32 = 5;

/// Fixed delay between transport-level retry attempts.
pub const FETCH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Suffix appended to the output path to name the checkpoint sidecar.
pub const SIDECAR_SUFFIX: &str = ".audisto_";

/// Weight of the newest sample in the smoothed seconds-per-1000-rows estimate.
pub const RATE_SMOOTHING_FACTOR: f64 = 0.005;

/// Initial seconds-per-1000-rows estimate before any chunk was measured.
pub const INITIAL_SECONDS_PER_1000: f64 = 5.0;
