//! Host command implementation.

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use fileportal_core::channel::tcp;

use super::HostArgs;

/// Run the host command.
pub async fn run(args: HostArgs) -> Result<()> {
    let config = super::load_config();
    config.validate()?;

    let transfer_count = config.transfer.transfer_count()?;
    let port = args.port.unwrap_or(config.network.port);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to listen on port {}", port))?;
    let local = listener.local_addr()?;

    println!();
    println!("  FilePortal - hosting on {}", local);
    println!("  Waiting for a peer to join...");

    let options = config.link_options();
    let channels = tokio::select! {
        accepted = tcp::accept(&listener, transfer_count, &options) => accepted?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("  Cancelled.");
            return Ok(());
        }
    };
    drop(listener);

    super::peer::run(channels, &config, &args.session).await
}
