//! Destination for exported rows: a file or standard output.

use std::fmt;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::debug;

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

enum Writer {
    /// Output file; flushed rows are synced to disk.
    File(BufWriter<File>),
    /// Standard output or another stream with nothing to sync.
    Stream(BufWriter<BoxedWriter>),
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, row: &[u8]) -> std::io::Result<()> {
    writer.write_all(row).await?;
    writer.write_all(b"\n").await
}

/// Buffered line writer. Every row is written followed by `\n`.
pub struct OutputSink {
    writer: Writer,
    label: String,
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("label", &self.label)
            .field("synced", &matches!(self.writer, Writer::File(_)))
            .finish_non_exhaustive()
    }
}

impl OutputSink {
    /// Creates `path`, failing if it already exists.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from opening the file.
    pub async fn create_file(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        debug!(path = %path.display(), "output file created");
        Ok(Self::from_file(file, path))
    }

    /// Opens an existing `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from opening the file.
    pub async fn append_file(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path).await?;
        debug!(path = %path.display(), "output file opened for append");
        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: &Path) -> Self {
        Self {
            writer: Writer::File(BufWriter::new(file)),
            label: path.display().to_string(),
        }
    }

    /// Writes to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::from_writer(tokio::io::stdout(), "<stdout>")
    }

    /// Wraps an arbitrary writer. Flushing never syncs it.
    pub fn from_writer(
        writer: impl AsyncWrite + Unpin + Send + 'static,
        label: impl Into<String>,
    ) -> Self {
        Self {
            writer: Writer::Stream(BufWriter::new(Box::new(writer))),
            label: label.into(),
        }
    }

    /// Human-readable destination name for logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Writes one row and its line terminator.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from the underlying writer.
    pub async fn write_row(&mut self, row: &[u8]) -> std::io::Result<()> {
        match &mut self.writer {
            Writer::File(writer) => write_line(writer, row).await,
            Writer::Stream(writer) => write_line(writer, row).await,
        }
    }

    /// Pushes buffered rows to the destination. For a file, returns only
    /// once the data has reached the disk.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from the underlying writer or from the sync.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.writer {
            Writer::File(writer) => {
                writer.flush().await?;
                writer.get_ref().sync_data().await
            }
            Writer::Stream(writer) => writer.flush().await,
        }
    }
}
