//! Chunk distributor (sending side).
//!
//! Splits a file buffer into `chunk_size` pieces and sends piece `i` on
//! channel `i mod N`, strictly in ascending `i`. No index travels with the
//! payload: the receiver recovers it from the channel label and the order of
//! arrival on that channel.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::pool::ChannelPool;

/// Number of chunks a buffer of `len` bytes splits into: `ceil(len / chunk_size)`.
///
/// `chunk_size` must be non-zero.
#[must_use]
pub fn total_chunks(len: usize, chunk_size: usize) -> u64 {
    len.div_ceil(chunk_size) as u64
}

/// xxh3-64 digest of a file, for comparing both ends of a transfer.
#[must_use]
pub fn fingerprint(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Sends a file buffer across a [`ChannelPool`].
#[derive(Debug, Clone)]
pub struct Distributor {
    pool: ChannelPool,
    chunk_size: usize,
}

impl Distributor {
    /// Create a distributor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `chunk_size` is zero.
    pub fn new(pool: ChannelPool, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig {
                key: "chunk_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(Self { pool, chunk_size })
    }

    /// Configured chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Send every chunk of `data` in index order. Returns the number of
    /// chunks sent.
    ///
    /// # Errors
    ///
    /// Stops at the first channel failure and returns it; no retry.
    pub async fn dispatch(&self, data: &[u8]) -> Result<u64> {
        let total = total_chunks(data.len(), self.chunk_size);
        tracing::debug!(
            "Dispatching {} chunks over {} channels (xxh3 {:016x})",
            total,
            self.pool.transfer_count(),
            fingerprint(data)
        );

        let mut sent = 0u64;
        for chunk in data.chunks(self.chunk_size) {
            self.pool.send_chunk(sent, chunk.to_vec()).await?;
            sent += 1;
        }

        debug_assert_eq!(sent, total);
        Ok(sent)
    }
}
