//! Session setup: console output, a fresh file export, or a resumed one.
//!
//! Decision table for file mode (`startAnew` = neither output nor sidecar exists):
//!
//! | resume requested | startAnew | outcome                                  |
//! |------------------|-----------|------------------------------------------|
//! | no               | any       | fresh export; refuse to overwrite output |
//! | yes              | yes       | fresh export                             |
//! | yes              | no        | resume from the sidecar                  |

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, instrument, warn};

use super::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use super::engine::EngineConfig;
use super::error::TransferError;
use super::fetcher::ChunkFetcher;
use super::sink::OutputSink;
use super::status::TransferStatus;

/// Errors that prevent a session from starting.
///
/// None of them touch the output file or an existing sidecar.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A fresh export would overwrite an existing file.
    #[error("output file {0} already exists; remove it or resume the download")]
    OutputExists(PathBuf),

    /// Resuming, but the output file is gone.
    #[error("cannot resume: output file {0} does not exist")]
    OutputMissing(PathBuf),

    /// Resuming, but the sidecar is gone.
    #[error("cannot resume: checkpoint {0} does not exist")]
    CheckpointMissing(PathBuf),

    /// The sidecar was written with a different detail setting.
    #[error(
        "This file was begun with --no-details={persisted}; continuing with --no-details={requested} will break the file."
    )]
    DetailFlagMismatch {
        /// `--no-details` value stored in the sidecar.
        persisted: bool,
        /// `--no-details` value of this invocation.
        requested: bool,
    },

    /// Reading or writing the sidecar failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Creating or opening the output file failed.
    #[error("failed to open output {path}: {source}")]
    Io {
        /// Output path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The total-count probe failed.
    #[error(transparent)]
    Probe(#[from] TransferError),
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Output file; `None` writes to standard output without a checkpoint.
    pub output: Option<PathBuf>,
    /// Whether detail columns (`deep=1`) are requested.
    pub detail: bool,
    /// Whether an interrupted export may be continued.
    pub resume: bool,
}

impl SessionRequest {
    /// Export to `path`.
    pub fn to_file(path: impl Into<PathBuf>, detail: bool, resume: bool) -> Self {
        Self {
            output: Some(path.into()),
            detail,
            resume,
        }
    }

    /// Export to standard output.
    #[must_use]
    pub fn to_console(detail: bool) -> Self {
        Self {
            output: None,
            detail,
            resume: false,
        }
    }
}

/// Durable state and output destination for one engine run.
#[derive(Debug)]
pub struct Session {
    pub(crate) checkpoint: Checkpoint,
    pub(crate) store: Option<CheckpointStore>,
    pub(crate) sink: OutputSink,
    pub(crate) resumed: bool,
}

impl Session {
    /// Assembles a session from parts. `store` is `None` for console output.
    #[must_use]
    pub fn new(checkpoint: Checkpoint, store: Option<CheckpointStore>, sink: OutputSink) -> Self {
        Self {
            checkpoint,
            store,
            sink,
            resumed: false,
        }
    }

    /// Opens a session for `request`.
    ///
    /// Resume preconditions are checked before any network call, so a refused
    /// resume leaves both the output and the sidecar untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when preconditions fail, the probe fails, or
    /// the output or sidecar cannot be opened.
    #[instrument(skip(fetcher, config, status), fields(crawl = fetcher.crawl_id()))]
    pub async fn open(
        request: &SessionRequest,
        fetcher: &ChunkFetcher,
        config: &EngineConfig,
        status: &TransferStatus,
    ) -> Result<Self, SessionError> {
        let Some(output) = request.output.as_deref() else {
            let total = fetcher.probe_total(&config.retry_policy, status).await?;
            let checkpoint = Checkpoint::new("", total, request.detail, config.initial_chunk_size);
            return Ok(Self::new(checkpoint, None, OutputSink::stdout()));
        };

        let store = CheckpointStore::for_output(output);
        let start_anew = !output.exists() && !store.exists();
        if !request.resume || start_anew {
            if start_anew && request.resume {
                info!("No download to resume; starting new.");
            }
            return Self::start_fresh(output, store, request.detail, fetcher, config, status)
                .await;
        }
        Self::resume(output, store, request.detail, config).await
    }

    async fn start_fresh(
        output: &Path,
        store: CheckpointStore,
        detail: bool,
        fetcher: &ChunkFetcher,
        config: &EngineConfig,
        status: &TransferStatus,
    ) -> Result<Self, SessionError> {
        if output.exists() {
            return Err(SessionError::OutputExists(output.to_path_buf()));
        }
        let total = fetcher.probe_total(&config.retry_policy, status).await?;
        let checkpoint = Checkpoint::new(
            output.to_string_lossy(),
            total,
            detail,
            config.initial_chunk_size,
        );
        store.save(&checkpoint)?;

        let sink = match OutputSink::create_file(output).await {
            Ok(sink) => sink,
            Err(source) => {
                store.remove()?;
                return Err(SessionError::Io {
                    path: output.to_path_buf(),
                    source,
                });
            }
        };
        info!(output = %output.display(), total, "starting new download");
        Ok(Self::new(checkpoint, Some(store), sink))
    }

    async fn resume(
        output: &Path,
        store: CheckpointStore,
        detail: bool,
        config: &EngineConfig,
    ) -> Result<Self, SessionError> {
        if !output.exists() {
            return Err(SessionError::OutputMissing(output.to_path_buf()));
        }
        if !store.exists() {
            return Err(SessionError::CheckpointMissing(store.path().to_path_buf()));
        }

        let mut checkpoint = store.load()?;
        if checkpoint.detail() != detail {
            return Err(SessionError::DetailFlagMismatch {
                persisted: !checkpoint.detail(),
                requested: !detail,
            });
        }
        if checkpoint.output_filename() != output.to_string_lossy() {
            warn!(
                recorded = checkpoint.output_filename(),
                output = %output.display(),
                "checkpoint was written for a different path"
            );
        }
        if checkpoint.chunk_size() == 0 {
            checkpoint.set_chunk_size(config.initial_chunk_size);
        }

        let sink = OutputSink::append_file(output)
            .await
            .map_err(|source| SessionError::Io {
                path: output.to_path_buf(),
                source,
            })?;
        info!(
            output = %output.display(),
            done = checkpoint.done_elements(),
            total = checkpoint.total_elements(),
            "resuming download"
        );
        Ok(Self {
            checkpoint,
            store: Some(store),
            sink,
            resumed: true,
        })
    }

    /// Whether progress is persisted to a sidecar.
    #[must_use]
    pub fn has_checkpoint(&self) -> bool {
        self.store.is_some()
    }
}
