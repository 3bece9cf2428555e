//! Checkpoint sidecar persisted next to the output file.
//!
//! The sidecar lives at `<output>.audisto_` and holds just enough state to
//! resume an interrupted export: how many rows are already in the output, how
//! many the crawl has, whether detail columns were requested, and the current
//! chunk size. It is rewritten atomically after every committed chunk and
//! removed once the export completes.
//!
//! On-disk format (tab-indented JSON):
//!
//! ```json
//! {
//! 	"outputFilename": "pages.tsv",
//! 	"doneElements": 20000,
//! 	"totalElements": 25000,
//! 	"noDetails": false,
//! 	"chunkSize": 5000
//! }
//! ```

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::constants::SIDECAR_SUFFIX;

/// Errors reading or writing the checkpoint sidecar.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// I/O error on the sidecar or its temporary file.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        /// Sidecar path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The checkpoint could not be encoded.
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The sidecar exists but is not a valid checkpoint document.
    #[error("corrupt checkpoint at {path}: {source}")]
    Deserialize {
        /// Sidecar path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The sidecar parsed but its counters contradict each other.
    #[error("inconsistent checkpoint at {path}: {done} rows done of {total}")]
    Inconsistent {
        /// Sidecar path.
        path: PathBuf,
        /// Persisted row count.
        done: u64,
        /// Persisted total.
        total: u64,
    },
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable progress record of one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    output_filename: String,
    done_elements: u64,
    total_elements: u64,
    no_details: bool,
    /// Zero in sidecars written before the chunk size was persisted.
    #[serde(default)]
    chunk_size: u64,
}

impl Checkpoint {
    /// Creates a checkpoint for a fresh export with no rows written.
    pub fn new(
        output_filename: impl Into<String>,
        total_elements: u64,
        detail: bool,
        chunk_size: u64,
    ) -> Self {
        Self {
            output_filename: output_filename.into(),
            done_elements: 0,
            total_elements,
            no_details: !detail,
            chunk_size,
        }
    }

    /// Output path the checkpoint was written for.
    #[must_use]
    pub fn output_filename(&self) -> &str {
        &self.output_filename
    }

    /// Rows already present in the output.
    #[must_use]
    pub fn done_elements(&self) -> u64 {
        self.done_elements
    }

    /// Rows the crawl has in total.
    #[must_use]
    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    /// Rows still to fetch.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total_elements.saturating_sub(self.done_elements)
    }

    /// Whether every row has been written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done_elements >= self.total_elements
    }

    /// Whether detail columns (`deep=1`) were requested.
    #[must_use]
    pub fn detail(&self) -> bool {
        !self.no_details
    }

    /// Persisted chunk size, or zero if the sidecar predates it.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub(crate) fn set_chunk_size(&mut self, chunk_size: u64) {
        self.chunk_size = chunk_size;
    }

    /// Records `rows` more rows as committed.
    pub(crate) fn advance(&mut self, rows: u64) {
        self.done_elements = self.done_elements.saturating_add(rows);
    }
}

/// Sidecar path for `output`: the output path with [`SIDECAR_SUFFIX`] appended.
#[must_use]
pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut path = output.as_os_str().to_owned();
    path.push(SIDECAR_SUFFIX);
    PathBuf::from(path)
}

/// Reads and atomically writes one sidecar file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Creates a store for the sidecar at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a store for the sidecar that belongs to `output`.
    #[must_use]
    pub fn for_output(output: &Path) -> Self {
        Self::new(sidecar_path(output))
    }

    /// Sidecar location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the sidecar exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the file cannot be read,
    /// [`CheckpointError::Deserialize`] for invalid JSON, and
    /// [`CheckpointError::Inconsistent`] when more rows are done than exist.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let bytes = fs::read(&self.path).map_err(|e| CheckpointError::io(&self.path, e))?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Deserialize {
                path: self.path.clone(),
                source,
            })?;
        if checkpoint.done_elements > checkpoint.total_elements {
            return Err(CheckpointError::Inconsistent {
                path: self.path.clone(),
                done: checkpoint.done_elements,
                total: checkpoint.total_elements,
            });
        }
        debug!(
            done = checkpoint.done_elements,
            total = checkpoint.total_elements,
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }

    /// Writes `checkpoint`, replacing any previous sidecar atomically.
    ///
    /// The document goes to a temporary file in the same directory, is synced,
    /// and then renamed over the sidecar, so a crash leaves either the old or
    /// the new checkpoint on disk and never a partial one.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if encoding, writing or renaming fails.
    #[instrument(level = "debug", skip(self, checkpoint), fields(path = %self.path.display()))]
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let document = encode(checkpoint)?;

        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        temp.write_all(&document)
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        temp.flush().map_err(|e| CheckpointError::io(&self.path, e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        temp.persist(&self.path)
            .map_err(|e| CheckpointError::io(&self.path, e.error))?;

        // Make the rename durable.
        if let Ok(dir) = fs::File::open(parent)
            && let Err(error) = dir.sync_all()
        {
            warn!(%error, "failed to sync checkpoint directory");
        }

        debug!(done = checkpoint.done_elements, "checkpoint saved");
        Ok(())
    }

    /// Deletes the sidecar. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] for any other removal failure.
    pub fn remove(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(&self.path, e)),
        }
    }
}

/// Pretty-prints with tab indentation.
fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>, CheckpointError> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    checkpoint
        .serialize(&mut serializer)
        .map_err(CheckpointError::Serialize)?;
    Ok(buffer)
}
