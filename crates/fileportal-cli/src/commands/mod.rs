//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> fileportal_core::config::Config {
    fileportal_core::config::Config::load().unwrap_or_else(|e| {
        tracing::warn!("Using default configuration: {}", e);
        fileportal_core::config::Config::default()
    })
}

pub mod config;
pub mod host;
pub mod join;
pub mod peer;
pub mod selftest;

/// FilePortal - peer-to-peer file transfer over parallel ordered channels
#[derive(Parser)]
#[command(name = "fileportal")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Wait for a peer to join, then exchange files
    Host(HostArgs),

    /// Join a hosting peer, then exchange files
    Join(JoinArgs),

    /// Run a sender and a receiver in-process and verify the result
    Selftest(SelftestArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Options shared by `host` and `join`
#[derive(Parser, Debug, Clone)]
pub struct SessionArgs {
    /// Offer this file once connected, then exit
    #[arg(short, long)]
    pub send: Option<PathBuf>,

    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Accept incoming files without asking
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Arguments for the host command
#[derive(Parser)]
pub struct HostArgs {
    /// TCP port to listen on (defaults to the configured port)
    #[arg(short, long)]
    pub port: Option<u16>,

    #[command(flatten)]
    pub session: SessionArgs,
}

/// Arguments for the join command
#[derive(Parser)]
pub struct JoinArgs {
    /// Address of the hosting peer (HOST or HOST:PORT)
    pub addr: String,

    #[command(flatten)]
    pub session: SessionArgs,
}

/// Arguments for the selftest command
#[derive(Parser)]
pub struct SelftestArgs {
    /// Size of the generated file in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub size: usize,

    /// Number of transfer channels (defaults to the configured count)
    #[arg(long)]
    pub channels: Option<u16>,

    /// Chunk size in bytes (defaults to the configured size)
    #[arg(long)]
    pub chunk_size: Option<usize>,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g. transfer.chunk_size)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Value to set
        value: String,
    },

    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}
