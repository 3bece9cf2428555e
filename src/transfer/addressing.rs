//! Mapping of already-written rows onto the next chunk request.
//!
//! The API numbers chunks from zero: chunk `i` of size `s` carries a header
//! row followed by rows `i * s .. (i + 1) * s` of the table. The address is
//! recomputed from scratch before every request, so it stays correct when the
//! chunk size changes between requests.

/// Position of the next chunk to request and how many of its leading rows
/// are already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAddress {
    /// Zero-based chunk number passed as the `chunk` query parameter.
    pub index: u64,
    /// Leading rows of the chunk body to discard, header row included.
    pub skip: u64,
}

impl ChunkAddress {
    /// Locates row `done` in a stream of chunks of `chunk_size` rows.
    ///
    /// With nothing written yet the very first chunk is requested and its
    /// header is kept. Otherwise the header plus the `done % chunk_size` rows
    /// already persisted from this chunk window are skipped.
    ///
    /// `chunk_size` must be non-zero; the engine never lets it reach zero.
    #[must_use]
    pub fn locate(done: u64, chunk_size: u64) -> Self {
        if done == 0 {
            return Self { index: 0, skip: 0 };
        }
        let chunk_size = chunk_size.max(1);
        Self {
            index: done / chunk_size,
            skip: done % chunk_size + 1,
        }
    }
}
