//! Selftest command implementation.
//!
//! Runs a sending and a receiving session against each other over an
//! in-memory link and checks that the file arrives intact.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;

use fileportal_core::channel::memory;
use fileportal_core::distributor::{fingerprint, total_chunks};
use fileportal_core::pool::ChannelPool;
use fileportal_core::session::Session;
use fileportal_core::ui::{Outcome, SelectedFile, UserInterface};

use super::SelftestArgs;
use crate::ui::{format_size, print_progress};

const FILE_NAME: &str = "selftest.bin";

/// UI for one side of the loopback pair.
struct LoopbackUi {
    show_progress: bool,
    delivered: Mutex<Option<Vec<u8>>>,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl LoopbackUi {
    fn new(show_progress: bool, outcomes: mpsc::UnboundedSender<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            show_progress,
            delivered: Mutex::new(None),
            outcomes,
        })
    }

    fn take_delivered(&self) -> Option<Vec<u8>> {
        self.delivered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

impl UserInterface for LoopbackUi {
    async fn confirm(&self, _filename: &str) -> bool {
        true
    }

    async fn select_file(&self) -> Option<SelectedFile> {
        None
    }

    fn show_progress(&self, value: u64, max: u64) {
        if self.show_progress {
            print_progress(value, max);
        }
    }

    fn notify(&self, message: &str) {
        tracing::debug!("{}", message);
    }

    fn deliver_artifact(&self, data: &[u8], _filename: &str) -> fileportal_core::Result<()> {
        *self
            .delivered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(data.to_vec());
        Ok(())
    }

    fn finished(&self, outcome: &Outcome) {
        let _ = self.outcomes.send(outcome.clone());
    }
}

/// Run the selftest command.
pub async fn run(args: SelftestArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(channels) = args.channels {
        config.transfer.channel_count = u32::from(channels);
    }
    if let Some(chunk_size) = args.chunk_size {
        config.transfer.chunk_size = chunk_size;
    }
    config.validate()?;

    let transfer_count = config.transfer.transfer_count()?;
    let (near, far) = memory::link(transfer_count, config.transfer.queue_depth);

    let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
    let sender_ui = LoopbackUi::new(false, outcomes_tx.clone());
    let receiver_ui = LoopbackUi::new(true, outcomes_tx);

    let (pool, events) = ChannelPool::new(near, transfer_count)?;
    let (sender, sender_handle) = Session::new(pool, events, sender_ui, &config.transfer)?;
    let (pool, events) = ChannelPool::new(far, transfer_count)?;
    let (receiver, receiver_handle) =
        Session::new(pool, events, Arc::clone(&receiver_ui), &config.transfer)?;
    let sender_task = tokio::spawn(sender.run());
    let receiver_task = tokio::spawn(receiver.run());

    let data = generate(args.size);
    let expected = fingerprint(&data);

    println!();
    println!("  FilePortal selftest");
    println!("  {}", "─".repeat(50));
    println!("  Size:     {}", format_size(data.len() as u64));
    println!(
        "  Chunks:   {} x {} bytes",
        total_chunks(data.len(), config.transfer.chunk_size),
        config.transfer.chunk_size
    );
    println!("  Channels: {} + metadata", transfer_count);
    println!("  xxh3:     {:016x}", expected);
    println!();

    let started = Instant::now();
    sender_handle.send_file(FILE_NAME, data).await?;

    let result = tokio::select! {
        settled = wait_for_both(&mut outcomes) => settled,
        _ = tokio::signal::ctrl_c() => {
            println!();
            Err(anyhow::anyhow!("Selftest cancelled"))
        }
    };
    let elapsed = started.elapsed();

    sender_handle.shutdown().await;
    receiver_handle.shutdown().await;
    let _ = sender_task.await;
    let _ = receiver_task.await;
    result?;

    let received = receiver_ui
        .take_delivered()
        .ok_or_else(|| anyhow::anyhow!("Receiver finished without delivering the file"))?;
    let actual = fingerprint(&received);
    if actual != expected || received.len() != args.size {
        anyhow::bail!(
            "Selftest failed: received {} bytes with xxh3 {:016x}, expected {} bytes with {:016x}",
            received.len(),
            actual,
            args.size,
            expected
        );
    }

    let secs = elapsed.as_secs_f64();
    println!("  Verified: xxh3 {:016x}", actual);
    println!("  Elapsed:  {:.2}s", secs);
    if secs > 0.0 {
        println!(
            "  Speed:    {}/s",
            format_size((received.len() as f64 / secs) as u64)
        );
    }
    println!();

    Ok(())
}

/// Wait until both the sender and the receiver report success.
async fn wait_for_both(outcomes: &mut mpsc::UnboundedReceiver<Outcome>) -> Result<()> {
    let mut sent = false;
    let mut received = false;

    while !(sent && received) {
        match outcomes.recv().await {
            Some(Outcome::Sent { .. }) => sent = true,
            Some(Outcome::Received { .. }) => received = true,
            Some(other) => anyhow::bail!("Selftest failed: {}", other),
            None => anyhow::bail!("Selftest failed: sessions ended early"),
        }
    }

    Ok(())
}

/// Deterministic pseudo-random test data (xorshift64).
fn generate(size: usize) -> Vec<u8> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut data = Vec::with_capacity(size + 8);

    while data.len() < size {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(size);

    data
}
