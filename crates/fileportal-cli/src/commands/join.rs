//! Join command implementation.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};

use fileportal_core::channel::tcp;

use super::JoinArgs;

/// Run the join command.
pub async fn run(args: JoinArgs) -> Result<()> {
    let config = super::load_config();
    config.validate()?;

    let transfer_count = config.transfer.transfer_count()?;
    let addr = resolve(&args.addr, config.network.port).await?;

    println!();
    println!("  FilePortal - joining {}", addr);
    println!("  Opening {} channels...", u32::from(transfer_count) + 1);

    let options = config.link_options();
    let channels = tokio::select! {
        connected = tcp::connect(addr, transfer_count, &options) => connected?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("  Cancelled.");
            return Ok(());
        }
    };

    super::peer::run(channels, &config, &args.session).await
}

/// Resolve `HOST` or `HOST:PORT`, using `default_port` when none is given.
async fn resolve(addr: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok(socket);
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let target = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, default_port)
    };

    let resolved = tokio::net::lookup_host(target.as_str())
        .await
        .with_context(|| format!("Failed to resolve {}", addr))?
        .next()
        .with_context(|| format!("No address found for {}", addr))?;

    Ok(resolved)
}
