//! Chunk reassembler (receiving side).
//!
//! Chunks carry no index. Chunk `i` travels on channel `i mod N` and each
//! channel delivers in order, so the `k`-th arrival on channel `c` is chunk
//! `c + k * N`. The reassembler keeps one "next expected" counter per
//! channel, starting at `c` and advancing by `N`.
//!
//! Anything that does not fit that model (a slot written twice, more chunks
//! on a channel than it was assigned, an oversized payload, an unknown
//! channel) is returned as a [`ProtocolViolation`]. Violations leave the
//! reassembler untouched: nothing is relocated, counted or reported as
//! progress.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{Error, ProtocolViolation};

/// Largest chunk count a receiver will allocate for.
pub const MAX_TOTAL_CHUNKS: u64 = 1 << 20;

/// A fully reassembled file.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// File name announced by the sender
    pub filename: String,
    /// Reassembled bytes
    pub data: Vec<u8>,
    /// Time from acceptance to the last chunk
    pub elapsed: Duration,
}

impl Artifact {
    /// xxh3-64 digest of the reassembled bytes.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        crate::distributor::fingerprint(&self.data)
    }
}

/// Result of an accepted chunk.
#[derive(Debug)]
pub enum Arrival {
    /// Chunk stored; carries the new received count
    Progress(u64),
    /// Last chunk stored; the file is complete
    Complete(Artifact),
}

/// Rebuilds one file from channel-tagged arrivals.
#[derive(Debug)]
pub struct Reassembler {
    id: Uuid,
    filename: String,
    total_chunks: u64,
    transfer_count: u16,
    chunk_size: usize,
    slots: Vec<Option<Vec<u8>>>,
    next_expected: Vec<u64>,
    received: u64,
    started_at: Instant,
    completed: bool,
}

impl Reassembler {
    /// Allocate a reassembler for `total_chunks` chunks arriving over
    /// `transfer_count` channels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChannelSet`] if `transfer_count` is zero and
    /// [`ProtocolViolation::TooManyChunks`] if `total_chunks` exceeds
    /// [`MAX_TOTAL_CHUNKS`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(
        filename: impl Into<String>,
        total_chunks: u64,
        transfer_count: u16,
        chunk_size: usize,
    ) -> crate::Result<Self> {
        let filename = filename.into();
        if transfer_count == 0 {
            return Err(Error::InvalidChannelSet("no transfer channels".to_string()));
        }
        if total_chunks > MAX_TOTAL_CHUNKS {
            return Err(ProtocolViolation::TooManyChunks {
                filename,
                total: total_chunks,
                limit: MAX_TOTAL_CHUNKS,
            }
            .into());
        }

        Ok(Self {
            id: Uuid::new_v4(),
            filename,
            total_chunks,
            transfer_count,
            chunk_size,
            slots: vec![None; total_chunks as usize],
            next_expected: (0..u64::from(transfer_count)).collect(),
            received: 0,
            started_at: Instant::now(),
            completed: false,
        })
    }

    /// Local identifier used in logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// File name announced by the sender.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Total chunk count.
    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Chunks stored so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Whether the artifact has been produced.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Slot the next chunk on `channel` will fill.
    #[must_use]
    pub fn expected_slot(&self, channel: u16) -> Option<u64> {
        self.next_expected.get(usize::from(channel)).copied()
    }

    /// Store a chunk that arrived on `channel`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolViolation`] if the chunk cannot be placed; the
    /// reassembler state is unchanged in that case.
    pub fn accept(&mut self, channel: u16, data: Vec<u8>) -> Result<Arrival, ProtocolViolation> {
        let Some(&index) = self.next_expected.get(usize::from(channel)) else {
            return Err(ProtocolViolation::UnknownChannel { channel });
        };

        if data.len() > self.chunk_size {
            return Err(ProtocolViolation::OversizedChunk {
                channel,
                size: data.len(),
                limit: self.chunk_size,
            });
        }

        let arrival = self.place(channel, index, data)?;
        self.next_expected[usize::from(channel)] += u64::from(self.transfer_count);
        Ok(arrival)
    }

    /// Produce the artifact if every chunk is present and it has not been
    /// produced yet. For an empty file this succeeds right away.
    pub fn try_finish(&mut self) -> Option<Artifact> {
        if self.completed || self.received != self.total_chunks {
            return None;
        }
        self.completed = true;

        let size = self.slots.iter().flatten().map(Vec::len).sum();
        let mut data = Vec::with_capacity(size);
        for slot in &mut self.slots {
            if let Some(chunk) = slot.take() {
                data.extend_from_slice(&chunk);
            }
        }

        let elapsed = self.started_at.elapsed();
        let artifact = Artifact {
            filename: self.filename.clone(),
            data,
            elapsed,
        };
        tracing::debug!(
            "Transfer {} reassembled {} bytes in {:.3}s (xxh3 {:016x})",
            self.id,
            artifact.data.len(),
            elapsed.as_secs_f64(),
            artifact.fingerprint()
        );

        Some(artifact)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn place(&mut self, channel: u16, index: u64, data: Vec<u8>) -> Result<Arrival, ProtocolViolation> {
        if self.completed || index >= self.total_chunks {
            return Err(ProtocolViolation::ChannelOverrun {
                channel,
                index,
                total: self.total_chunks,
            });
        }

        let slot = &mut self.slots[index as usize];
        if slot.is_some() {
            return Err(ProtocolViolation::DuplicateSlot { channel, index });
        }
        *slot = Some(data);
        self.received += 1;

        Ok(self
            .try_finish()
            .map_or(Arrival::Progress(self.received), Arrival::Complete))
    }
}
