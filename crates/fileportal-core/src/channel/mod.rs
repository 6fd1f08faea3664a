//! Channels: ordered, reliable duplex message pipes identified by a label.
//!
//! A [`Channel`] is transport-agnostic. Each transport bridges its real pipe
//! onto a pair of queues:
//!
//! - outgoing: [`ChannelMessage`]s written by the pool, delivered in order
//! - incoming: `Result<ChannelMessage>`; a transport failure is delivered once
//!   as `Err` and the queue then closes
//!
//! Two transports ship with the crate:
//!
//! - [`memory`] - in-process loopback link
//! - [`tcp`] - one TCP connection per channel

pub mod memory;
pub mod tcp;

use std::fmt;
use std::str::FromStr;

use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Stable identity of a channel within a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelLabel {
    /// The control channel
    Metadata,
    /// A transfer channel, numbered from 0
    Transfer(u16),
}

impl ChannelLabel {
    /// All labels of a link with `transfer_count` transfer channels,
    /// metadata first.
    pub fn all(transfer_count: u16) -> impl Iterator<Item = Self> {
        std::iter::once(Self::Metadata).chain((0..transfer_count).map(Self::Transfer))
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => f.write_str(crate::METADATA_LABEL),
            Self::Transfer(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for ChannelLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == crate::METADATA_LABEL {
            return Ok(Self::Metadata);
        }
        s.parse::<u16>()
            .map(Self::Transfer)
            .map_err(|_| Error::InvalidLabel(s.to_string()))
    }
}

/// A single message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Text message (metadata channel)
    Text(String),
    /// Binary message (transfer channels)
    Binary(Vec<u8>),
}

/// One end of an ordered, reliable channel.
#[derive(Debug)]
pub struct Channel {
    label: ChannelLabel,
    outgoing: mpsc::Sender<ChannelMessage>,
    incoming: mpsc::Receiver<Result<ChannelMessage>>,
}

impl Channel {
    /// Assemble a channel from its queues.
    #[must_use]
    pub fn new(
        label: ChannelLabel,
        outgoing: mpsc::Sender<ChannelMessage>,
        incoming: mpsc::Receiver<Result<ChannelMessage>>,
    ) -> Self {
        Self {
            label,
            outgoing,
            incoming,
        }
    }

    /// The channel's label.
    #[must_use]
    pub fn label(&self) -> ChannelLabel {
        self.label
    }

    /// Send a message, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if the transport side is gone.
    pub async fn send(&self, message: ChannelMessage) -> Result<()> {
        self.outgoing.send(message).await.map_err(|_| Error::Channel {
            label: self.label,
            reason: "channel closed".to_string(),
        })
    }

    /// Receive the next message; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Result<ChannelMessage>> {
        self.incoming.recv().await
    }

    /// Split into label, outgoing and incoming halves.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        ChannelLabel,
        mpsc::Sender<ChannelMessage>,
        mpsc::Receiver<Result<ChannelMessage>>,
    ) {
        (self.label, self.outgoing, self.incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_display_and_parse() {
        assert_eq!(ChannelLabel::Metadata.to_string(), "metadata");
        assert_eq!(ChannelLabel::Transfer(42).to_string(), "42");

        assert_eq!(
            "metadata".parse::<ChannelLabel>().expect("parse"),
            ChannelLabel::Metadata
        );
        assert_eq!(
            "510".parse::<ChannelLabel>().expect("parse"),
            ChannelLabel::Transfer(510)
        );
    }

    #[test]
    fn test_label_parse_rejects_garbage() {
        assert!(matches!(
            "meta".parse::<ChannelLabel>(),
            Err(Error::InvalidLabel(_))
        ));
        assert!("-1".parse::<ChannelLabel>().is_err());
        assert!("70000".parse::<ChannelLabel>().is_err());
    }

    #[test]
    fn test_all_labels() {
        let labels: Vec<_> = ChannelLabel::all(3).collect();
        assert_eq!(
            labels,
            vec![
                ChannelLabel::Metadata,
                ChannelLabel::Transfer(0),
                ChannelLabel::Transfer(1),
                ChannelLabel::Transfer(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_on_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let (_in_tx, in_rx) = mpsc::channel(1);
        let channel = Channel::new(ChannelLabel::Transfer(7), tx, in_rx);
        drop(rx);

        let err = channel
            .send(ChannelMessage::Binary(vec![1]))
            .await
            .expect_err("closed");
        assert!(matches!(
            err,
            Error::Channel {
                label: ChannelLabel::Transfer(7),
                ..
            }
        ));
    }
}
