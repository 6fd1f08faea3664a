//! Config command implementation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use fileportal_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    let mut config = Config::load()?;

    match args.action {
        ConfigAction::Get { key } => {
            let value = get_config_value(&config, &key);
            match value {
                Some(v) => println!("{}: {}", key, v),
                None => println!("Unknown configuration key: {}", key),
            }
        }

        ConfigAction::Set { key, value } => {
            if set_config_value(&mut config, &key, &value)? {
                config.validate()?;
                config.save()?;
                println!("Set {} = {}", key, value);
            } else {
                println!("Unknown configuration key: {}", key);
            }
        }

        ConfigAction::Show => {
            println!();
            println!("FilePortal Configuration");
            println!("{}", "─".repeat(50));
            println!();
            println!("[transfer]");
            println!("  chunk_size = {}", config.transfer.chunk_size);
            println!("  channel_count = {}", config.transfer.channel_count);
            println!("  queue_depth = {}", config.transfer.queue_depth);
            println!();
            println!("[network]");
            println!("  port = {}", config.network.port);
            println!(
                "  handshake_timeout = \"{}s\"",
                config.network.handshake_timeout.as_secs()
            );
            println!("  keepalive = {}", config.network.keepalive);
            println!();
            println!("[receive]");
            match &config.receive.output_dir {
                Some(dir) => println!("  output_dir = \"{}\"", dir.display()),
                None => println!("  # output_dir is unset (current directory)"),
            }
            println!("  auto_accept = {}", config.receive.auto_accept);
            println!();
        }

        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }

        ConfigAction::Reset => {
            let config = Config::default();
            config.save()?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

fn get_config_value(config: &Config, key: &str) -> Option<String> {
    match key {
        "transfer.chunk_size" => Some(config.transfer.chunk_size.to_string()),
        "transfer.channel_count" => Some(config.transfer.channel_count.to_string()),
        "transfer.queue_depth" => Some(config.transfer.queue_depth.to_string()),
        "network.port" => Some(config.network.port.to_string()),
        "network.handshake_timeout" => {
            Some(format!("{}s", config.network.handshake_timeout.as_secs()))
        }
        "network.keepalive" => Some(config.network.keepalive.to_string()),
        "receive.output_dir" => Some(
            config
                .receive
                .output_dir
                .as_ref()
                .map_or_else(String::new, |dir| dir.display().to_string()),
        ),
        "receive.auto_accept" => Some(config.receive.auto_accept.to_string()),
        _ => None,
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<bool> {
    match key {
        "transfer.chunk_size" => {
            config.transfer.chunk_size = value.parse()?;
            Ok(true)
        }
        "transfer.channel_count" => {
            config.transfer.channel_count = value.parse()?;
            Ok(true)
        }
        "transfer.queue_depth" => {
            config.transfer.queue_depth = value.parse()?;
            Ok(true)
        }
        "network.port" => {
            config.network.port = value.parse()?;
            Ok(true)
        }
        "network.handshake_timeout" => {
            config.network.handshake_timeout = parse_duration(value)?;
            Ok(true)
        }
        "network.keepalive" => {
            config.network.keepalive = value.parse()?;
            Ok(true)
        }
        "receive.output_dir" => {
            config.receive.output_dir = if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
            Ok(true)
        }
        "receive.auto_accept" => {
            config.receive.auto_accept = value.parse()?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Parse `30`, `30s` or `2m`.
fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let secs = if let Some(mins) = value.strip_suffix('m') {
        mins.parse::<u64>()?.saturating_mul(60)
    } else {
        value.strip_suffix('s').unwrap_or(value).parse::<u64>()?
    };

    Ok(Duration::from_secs(secs))
}
