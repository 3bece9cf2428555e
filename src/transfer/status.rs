//! Progress counters shared between the transfer loop and the progress display.
//!
//! The engine is the only writer. Readers take a [`StatusSnapshot`] and never
//! mutate anything. All loads and stores use relaxed ordering: the values are
//! display approximations and no control flow depends on them.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::constants::{INITIAL_SECONDS_PER_1000, RATE_SMOOTHING_FACTOR};

/// Step of the transfer state machine the engine is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferPhase {
    /// Setting up the session (probe, checkpoint).
    Starting = 0,
    /// Waiting for a chunk response.
    Fetching = 1,
    /// Inspecting the response status.
    Classifying = 2,
    /// Appending rows to the output.
    Writing = 3,
    /// Persisting the checkpoint.
    Checkpointing = 4,
    /// Sleeping after a throttled or failed response.
    Paused = 5,
    /// All rows written and the checkpoint removed.
    Completed = 6,
    /// The session aborted.
    Failed = 7,
}

impl TransferPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fetching,
            2 => Self::Classifying,
            3 => Self::Writing,
            4 => Self::Checkpointing,
            5 => Self::Paused,
            6 => Self::Completed,
            7 => Self::Failed,
            _ => Self::Starting,
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Fetching => "fetching",
            Self::Classifying => "classifying",
            Self::Writing => "writing",
            Self::Checkpointing => "checkpointing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Live counters exposed by the engine.
#[derive(Debug)]
pub struct TransferStatus {
    done: AtomicU64,
    total: AtomicU64,
    chunk_size: AtomicU64,
    timeout_count: AtomicU32,
    error_count: AtomicU64,
    /// `f64` bits of the smoothed seconds-per-1000-rows estimate.
    seconds_per_1000: AtomicU64,
    phase: AtomicU8,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStatus {
    /// Creates a status with zeroed counters and the initial rate estimate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            done: AtomicU64::new(0),
            total: AtomicU64::new(0),
            chunk_size: AtomicU64::new(0),
            timeout_count: AtomicU32::new(0),
            error_count: AtomicU64::new(0),
            seconds_per_1000: AtomicU64::new(INITIAL_SECONDS_PER_1000.to_bits()),
            phase: AtomicU8::new(TransferPhase::Starting as u8),
        }
    }

    pub(crate) fn set_progress(&self, done: u64, total: u64) {
        self.done.store(done, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    pub(crate) fn set_chunk_size(&self, chunk_size: u64) {
        self.chunk_size.store(chunk_size, Ordering::Relaxed);
    }

    pub(crate) fn set_timeout_count(&self, count: u32) {
        self.timeout_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_phase(&self, phase: TransferPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    /// Counts one failed attempt or non-200 response.
    pub(crate) fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds one chunk's timing into the smoothed seconds-per-1000-rows estimate.
    ///
    /// `smoothed = α · sample + (1 − α) · smoothed`, where
    /// `sample = elapsed_seconds / (rows / 1000)`. Empty chunks are ignored.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn record_chunk_rate(&self, rows: u64, elapsed: Duration) {
        if rows == 0 {
            return;
        }
        let sample = elapsed.as_secs_f64() / (rows as f64 / 1000.0);
        let previous = f64::from_bits(self.seconds_per_1000.load(Ordering::Relaxed));
        let smoothed = RATE_SMOOTHING_FACTOR * sample + (1.0 - RATE_SMOOTHING_FACTOR) * previous;
        self.seconds_per_1000
            .store(smoothed.to_bits(), Ordering::Relaxed);
    }

    /// Rows written so far.
    #[must_use]
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Rows the API reported for the crawl.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Chunk size the next request uses.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// Gateway timeouts since the last chunk-size shrink.
    #[must_use]
    pub fn timeout_count(&self) -> u32 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    /// Failed attempts and non-200 responses this run.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Smoothed seconds needed per 1000 rows.
    #[must_use]
    pub fn seconds_per_1000(&self) -> f64 {
        f64::from_bits(self.seconds_per_1000.load(Ordering::Relaxed))
    }

    /// Current state machine step.
    #[must_use]
    pub fn phase(&self) -> TransferPhase {
        TransferPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    /// Reads all counters into a display record.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let done = self.done();
        let total = self.total();
        StatusSnapshot {
            done,
            total,
            percent_complete: percent_complete(done, total),
            eta: eta(done, total, self.seconds_per_1000()),
            chunk_size: self.chunk_size(),
            timeout_count: self.timeout_count(),
            error_count: self.error_count(),
            phase: self.phase(),
        }
    }
}

/// Point-in-time copy of [`TransferStatus`] for the progress display.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    /// Rows written so far.
    pub done: u64,
    /// Rows the API reported.
    pub total: u64,
    /// Completion percentage rounded half away from zero to one decimal.
    pub percent_complete: f64,
    /// Estimated remaining time, rounded to whole seconds.
    pub eta: Duration,
    /// Chunk size the next request uses.
    pub chunk_size: u64,
    /// Gateway timeouts since the last shrink.
    pub timeout_count: u32,
    /// Failed attempts and non-200 responses.
    pub error_count: u64,
    /// Current state machine step.
    pub phase: TransferPhase,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}% of {} pages | ETA {} | Chunk size {} | {} timeouts | {} errors |",
            self.percent_complete,
            self.total,
            format_eta(self.eta),
            self.chunk_size,
            self.timeout_count,
            self.error_count
        )
    }
}

/// `100 · done / total`, rounded half away from zero to one decimal.
#[allow(clippy::cast_precision_loss)]
fn percent_complete(done: u64, total: u64) -> f64 {
    if total == 0 || done == 0 {
        return 0.0;
    }
    let percent = 100.0 * done as f64 / total as f64;
    (percent * 10.0).round() / 10.0
}

/// Remaining thousands of rows times the smoothed seconds per thousand,
/// rounded to whole seconds.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn eta(done: u64, total: u64, seconds_per_1000: f64) -> Duration {
    let remaining = total.saturating_sub(done) as f64;
    let seconds = (remaining / 1000.0 * seconds_per_1000).round();
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs(seconds as u64)
    } else {
        Duration::ZERO
    }
}

/// Formats a duration as `1h2m3s`, dropping leading zero units.
#[must_use]
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
