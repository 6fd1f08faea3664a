//! In-process loopback link.
//!
//! Both peers live in the same process and every channel is a pair of tokio
//! queues. Dropping one end closes the other, which is how tests simulate a
//! lost connection.

use tokio::sync::mpsc;

use super::{Channel, ChannelLabel, ChannelMessage};
use crate::error::Result;

/// Build a full link with `transfer_count` transfer channels plus the
/// metadata channel. Returns the two peers' channel sets.
///
/// Must be called from within a tokio runtime.
#[must_use]
pub fn link(transfer_count: u16, queue_depth: usize) -> (Vec<Channel>, Vec<Channel>) {
    ChannelLabel::all(transfer_count)
        .map(|label| pipe(label, queue_depth))
        .unzip()
}

/// Build a single channel pair sharing `label`.
///
/// Must be called from within a tokio runtime.
#[must_use]
pub fn pipe(label: ChannelLabel, queue_depth: usize) -> (Channel, Channel) {
    let depth = queue_depth.max(1);

    let (a_out_tx, a_out_rx) = mpsc::channel(depth);
    let (a_in_tx, a_in_rx) = mpsc::channel(depth);
    let (b_out_tx, b_out_rx) = mpsc::channel(depth);
    let (b_in_tx, b_in_rx) = mpsc::channel(depth);

    tokio::spawn(forward(a_out_rx, b_in_tx));
    tokio::spawn(forward(b_out_rx, a_in_tx));

    (
        Channel::new(label, a_out_tx, a_in_rx),
        Channel::new(label, b_out_tx, b_in_rx),
    )
}

async fn forward(
    mut from: mpsc::Receiver<ChannelMessage>,
    to: mpsc::Sender<Result<ChannelMessage>>,
) {
    while let Some(message) = from.recv().await {
        if to.send(Ok(message)).await.is_err() {
            break;
        }
    }
}
