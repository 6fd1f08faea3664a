//! Running a session once the channel set is established.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinError;

use fileportal_core::channel::Channel;
use fileportal_core::config::Config;
use fileportal_core::distributor::fingerprint;
use fileportal_core::pool::ChannelPool;
use fileportal_core::session::{Session, SessionHandle, TransferState};
use fileportal_core::ui::Outcome;
use fileportal_core::Error;

use super::SessionArgs;
use crate::ui::{display_name, format_size, TerminalUi};

/// Run a session over `channels` until it ends.
///
/// With `--send` the file is offered once and the session is closed after
/// the outcome; otherwise incoming offers are served until Ctrl+C or until
/// the peer goes away.
pub async fn run(channels: Vec<Channel>, config: &Config, args: &SessionArgs) -> Result<()> {
    let transfer_count = config.transfer.transfer_count()?;
    let (pool, events) = ChannelPool::new(channels, transfer_count)?;

    let output_dir = args
        .output
        .clone()
        .or_else(|| config.receive.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let ui = Arc::new(TerminalUi::new(
        output_dir.clone(),
        args.yes || config.receive.auto_accept,
    ));

    let (session, handle) = Session::new(pool, events, Arc::clone(&ui), &config.transfer)?;
    let mut task = tokio::spawn(session.run());

    println!();
    println!(
        "  Connected over {} transfer channels + metadata",
        transfer_count
    );

    if let Some(path) = &args.send {
        let result = send_once(&handle, &ui, path).await;
        handle.shutdown().await;
        let _ = task.await;
        return result;
    }

    println!("  Saving received files to {}", output_dir.display());
    println!("  Press Ctrl+C to quit.");
    println!();

    tokio::select! {
        joined = &mut task => finish(joined),
        _ = tokio::signal::ctrl_c() => {
            println!();
            handle.shutdown().await;
            finish(task.await)
        }
    }
}

async fn send_once(handle: &SessionHandle, ui: &TerminalUi, path: &Path) -> Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = display_name(path);

    println!(
        "  Offering '{}' ({}, xxh3 {:016x})",
        name,
        format_size(data.len() as u64),
        fingerprint(&data)
    );

    let mut status = handle.subscribe();
    handle.send_file(name, data).await?;
    println!("  Waiting for the peer to accept...");

    tokio::select! {
        settled = async { status.wait_for(|s| s.state == TransferState::Idle).await.map(|_| ()) } => {
            settled.map_err(|_| Error::Disconnected)?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            anyhow::bail!("Transfer cancelled");
        }
    }

    match ui.take_outcome() {
        Some(Outcome::Sent { .. }) => Ok(()),
        Some(Outcome::Denied { filename }) => Err(Error::TransferDenied(filename).into()),
        Some(Outcome::Aborted { reason, .. }) => anyhow::bail!("Transfer aborted: {}", reason),
        _ => Err(Error::Disconnected.into()),
    }
}

fn finish(joined: std::result::Result<fileportal_core::Result<()>, JoinError>) -> Result<()> {
    match joined? {
        Ok(()) => Ok(()),
        Err(Error::Disconnected) => {
            println!("  Peer disconnected.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
