//! Channel pool: `N` transfer channels plus one metadata channel.
//!
//! Outgoing chunks are routed by index (`index mod N`). Every channel gets
//! its own receive task; all of them feed one [`PoolEvent`] queue so the
//! consumer sees a single serialized stream regardless of how arrivals
//! interleave across channels.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelLabel, ChannelMessage};
use crate::error::{Error, Result};
use crate::protocol::MetadataMessage;

/// Bound of the merged inbound event queue.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

/// Something that happened on one of the pool's channels.
#[derive(Debug)]
pub enum PoolEvent {
    /// A decoded message from the metadata channel
    Metadata(MetadataMessage),
    /// A chunk payload from a transfer channel
    Chunk {
        /// Label of the transfer channel it arrived on
        channel: u16,
        /// Raw payload
        data: Vec<u8>,
    },
    /// A channel failed or was closed; it will deliver nothing more
    ChannelLost {
        /// The channel that went away
        label: ChannelLabel,
        /// The transport error, `None` on an orderly close
        error: Option<Error>,
    },
}

/// Outgoing side of the pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelPool {
    metadata: mpsc::Sender<ChannelMessage>,
    transfer: Arc<[mpsc::Sender<ChannelMessage>]>,
    failed: Arc<Mutex<HashSet<ChannelLabel>>>,
}

impl ChannelPool {
    /// Build a pool from a complete channel set and start its receive loops.
    ///
    /// The set must hold exactly one metadata channel and exactly one channel
    /// for every transfer label `0..transfer_count`. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChannelSet`] if the set is incomplete,
    /// contains duplicates, or labels outside the pool.
    pub fn new(
        channels: Vec<Channel>,
        transfer_count: u16,
    ) -> Result<(Self, mpsc::Receiver<PoolEvent>)> {
        if transfer_count == 0 {
            return Err(Error::InvalidChannelSet(
                "at least one transfer channel is required".to_string(),
            ));
        }

        let mut metadata = None;
        let mut transfer: Vec<Option<Channel>> =
            (0..transfer_count).map(|_| None).collect();

        for channel in channels {
            let slot = match channel.label() {
                ChannelLabel::Metadata => &mut metadata,
                ChannelLabel::Transfer(n) => transfer.get_mut(usize::from(n)).ok_or_else(|| {
                    Error::InvalidChannelSet(format!(
                        "channel {n} outside pool of {transfer_count}"
                    ))
                })?,
            };
            if slot.is_some() {
                return Err(Error::InvalidChannelSet(format!(
                    "duplicate channel '{}'",
                    channel.label()
                )));
            }
            *slot = Some(channel);
        }

        let metadata = metadata
            .ok_or_else(|| Error::InvalidChannelSet("missing metadata channel".to_string()))?;
        let transfer = transfer
            .into_iter()
            .enumerate()
            .map(|(n, channel)| {
                channel.ok_or_else(|| Error::InvalidChannelSet(format!("missing channel {n}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let failed = Arc::new(Mutex::new(HashSet::new()));

        let (_, metadata_tx, metadata_rx) = metadata.into_parts();
        tokio::spawn(receive_loop(
            ChannelLabel::Metadata,
            metadata_rx,
            events_tx.clone(),
            Arc::clone(&failed),
        ));

        let mut transfer_tx = Vec::with_capacity(transfer.len());
        for channel in transfer {
            let (label, tx, rx) = channel.into_parts();
            tokio::spawn(receive_loop(
                label,
                rx,
                events_tx.clone(),
                Arc::clone(&failed),
            ));
            transfer_tx.push(tx);
        }

        tracing::debug!("Channel pool ready with {} transfer channels", transfer_count);

        Ok((
            Self {
                metadata: metadata_tx,
                transfer: transfer_tx.into(),
                failed,
            },
            events_rx,
        ))
    }

    /// Number of transfer channels.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn transfer_count(&self) -> u16 {
        self.transfer.len() as u16
    }

    /// Transfer channel that carries chunk `index`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn channel_for(&self, index: u64) -> u16 {
        (index % u64::from(self.transfer_count())) as u16
    }

    /// Whether any channel has failed or closed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.lock_failed().is_empty()
    }

    /// Lowest label among the failed channels, if any.
    #[must_use]
    pub fn failed_channel(&self) -> Option<ChannelLabel> {
        self.lock_failed().iter().min().copied()
    }

    /// Send chunk `index` on channel `index mod N`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if that channel has failed or closed.
    pub async fn send_chunk(&self, index: u64, data: Vec<u8>) -> Result<()> {
        let channel = self.channel_for(index);
        let label = ChannelLabel::Transfer(channel);
        self.ensure_usable(label)?;

        self.transfer[usize::from(channel)]
            .send(ChannelMessage::Binary(data))
            .await
            .map_err(|_| self.mark_failed(label))
    }

    /// Encode and send a metadata message.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the metadata channel is gone.
    pub async fn send_metadata(&self, message: &MetadataMessage) -> Result<()> {
        let label = ChannelLabel::Metadata;
        self.ensure_usable(label)?;

        let text = message.encode()?;
        tracing::debug!("-> {}", text);
        self.metadata
            .send(ChannelMessage::Text(text))
            .await
            .map_err(|_| self.mark_failed(label))
    }

    fn ensure_usable(&self, label: ChannelLabel) -> Result<()> {
        if self.lock_failed().contains(&label) {
            return Err(Error::Channel {
                label,
                reason: "channel has failed".to_string(),
            });
        }
        Ok(())
    }

    fn mark_failed(&self, label: ChannelLabel) -> Error {
        self.lock_failed().insert(label);
        Error::Channel {
            label,
            reason: "channel closed".to_string(),
        }
    }

    fn lock_failed(&self) -> std::sync::MutexGuard<'_, HashSet<ChannelLabel>> {
        self.failed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn receive_loop(
    label: ChannelLabel,
    mut incoming: mpsc::Receiver<Result<ChannelMessage>>,
    events: mpsc::Sender<PoolEvent>,
    failed: Arc<Mutex<HashSet<ChannelLabel>>>,
) {
    let error = loop {
        match incoming.recv().await {
            Some(Ok(message)) => {
                if let Some(event) = classify(label, message) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!("Channel '{}' failed: {}", label, e);
                break Some(e);
            }
            None => break None,
        }
    };

    failed
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(label);
    let _ = events.send(PoolEvent::ChannelLost { label, error }).await;
}

fn classify(label: ChannelLabel, message: ChannelMessage) -> Option<PoolEvent> {
    match (label, message) {
        (ChannelLabel::Metadata, ChannelMessage::Text(text)) => {
            tracing::debug!("<- {}", text);
            match MetadataMessage::decode(&text) {
                Ok(message) => Some(PoolEvent::Metadata(message)),
                Err(e) => {
                    tracing::warn!("Dropping malformed metadata message: {}", e);
                    None
                }
            }
        }
        (ChannelLabel::Transfer(channel), ChannelMessage::Binary(data)) => {
            Some(PoolEvent::Chunk { channel, data })
        }
        (ChannelLabel::Metadata, ChannelMessage::Binary(data)) => {
            tracing::warn!(
                "Dropping {} byte binary message on metadata channel",
                data.len()
            );
            None
        }
        (ChannelLabel::Transfer(channel), ChannelMessage::Text(_)) => {
            tracing::warn!("Dropping text message on transfer channel {}", channel);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;

    fn find(channels: &mut [Channel], label: ChannelLabel) -> &mut Channel {
        channels
            .iter_mut()
            .find(|c| c.label() == label)
            .expect("channel present")
    }

    #[tokio::test]
    async fn test_rejects_incomplete_set() {
        let (mut local, _remote) = memory::link(3, 4);
        local.retain(|c| c.label() != ChannelLabel::Transfer(1));

        let err = ChannelPool::new(local, 3).expect_err("incomplete");
        assert!(matches!(err, Error::InvalidChannelSet(msg) if msg.contains("missing channel 1")));
    }

    #[tokio::test]
    async fn test_rejects_missing_metadata() {
        let (mut local, _remote) = memory::link(2, 4);
        local.retain(|c| c.label() != ChannelLabel::Metadata);

        assert!(ChannelPool::new(local, 2).is_err());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_foreign_labels() {
        let (local, _remote) = memory::link(2, 4);
        let (extra, _other) = memory::pipe(ChannelLabel::Transfer(0), 4);
        let mut with_duplicate = local;
        with_duplicate.push(extra);
        assert!(ChannelPool::new(with_duplicate, 2).is_err());

        let (local, _remote) = memory::link(4, 4);
        assert!(ChannelPool::new(local, 2).is_err());
    }

    #[tokio::test]
    async fn test_chunks_route_round_robin() {
        let (local, mut remote) = memory::link(3, 8);
        let (pool, _events) = ChannelPool::new(local, 3).expect("pool");

        for index in 0..7u64 {
            pool.send_chunk(index, vec![index as u8]).await.expect("send");
        }

        for (channel, expected) in [(0u16, vec![0u8, 3, 6]), (1, vec![1, 4]), (2, vec![2, 5])] {
            let remote_channel = find(&mut remote, ChannelLabel::Transfer(channel));
            for byte in expected {
                let msg = remote_channel.recv().await.expect("open").expect("ok");
                assert_eq!(msg, ChannelMessage::Binary(vec![byte]));
            }
        }
    }

    #[tokio::test]
    async fn test_metadata_is_sent_as_json_text() {
        let (local, mut remote) = memory::link(1, 4);
        let (pool, _events) = ChannelPool::new(local, 1).expect("pool");

        pool.send_metadata(&MetadataMessage::Accepted)
            .await
            .expect("send");

        let msg = find(&mut remote, ChannelLabel::Metadata)
            .recv()
            .await
            .expect("open")
            .expect("ok");
        assert_eq!(msg, ChannelMessage::Text(r#"{"event":"accepted"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_inbound_classification() {
        let (local, remote) = memory::link(2, 4);
        let (_pool, mut events) = ChannelPool::new(local, 2).expect("pool");

        let metadata = remote
            .iter()
            .find(|c| c.label() == ChannelLabel::Metadata)
            .expect("metadata");
        metadata
            .send(ChannelMessage::Text("not json".to_string()))
            .await
            .expect("send");
        metadata
            .send(ChannelMessage::Text(r#"{"event":"denied"}"#.to_string()))
            .await
            .expect("send");

        match events.recv().await.expect("event") {
            PoolEvent::Metadata(MetadataMessage::Denied) => {}
            other => panic!("unexpected event: {other:?}"),
        }

        let transfer = remote
            .iter()
            .find(|c| c.label() == ChannelLabel::Transfer(1))
            .expect("transfer");
        transfer
            .send(ChannelMessage::Text("ignored".to_string()))
            .await
            .expect("send");
        transfer
            .send(ChannelMessage::Binary(vec![9, 9]))
            .await
            .expect("send");

        match events.recv().await.expect("event") {
            PoolEvent::Chunk { channel, data } => {
                assert_eq!(channel, 1);
                assert_eq!(data, vec![9, 9]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lost_channel_is_reported_and_refused() {
        let (local, mut remote) = memory::link(2, 4);
        let (pool, mut events) = ChannelPool::new(local, 2).expect("pool");

        let idx = remote
            .iter()
            .position(|c| c.label() == ChannelLabel::Transfer(1))
            .expect("transfer");
        drop(remote.remove(idx));

        match events.recv().await.expect("event") {
            PoolEvent::ChannelLost { label, error } => {
                assert_eq!(label, ChannelLabel::Transfer(1));
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(pool.is_degraded());
        assert_eq!(pool.failed_channel(), Some(ChannelLabel::Transfer(1)));
        assert!(pool.send_chunk(1, vec![0]).await.is_err());
        assert!(pool.send_chunk(0, vec![0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_for() {
        let (local, _remote) = memory::link(511, 1);
        let (pool, _events) = ChannelPool::new(local, 511).expect("pool");

        assert_eq!(pool.transfer_count(), 511);
        assert_eq!(pool.channel_for(0), 0);
        assert_eq!(pool.channel_for(510), 510);
        assert_eq!(pool.channel_for(511), 0);
        assert_eq!(pool.channel_for(1023), 1);
    }
}
