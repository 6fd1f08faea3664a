//! FilePortal CLI - peer-to-peer file transfer over parallel ordered channels
//!
//! One peer hosts, the other joins. Once the link is up either side can
//! offer a file; the other side is asked for consent before any data moves.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the receiving machine
//! fileportal host --output ./incoming
//!
//! # On the sending machine
//! fileportal join 192.168.1.20:52530 --send ./report.pdf
//!
//! # Check the transfer pipeline without a network
//! fileportal selftest --size 10000000
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::process::ExitCode;

use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Host(args) => commands::host::run(args).await,
        Command::Join(args) => commands::join::run(args).await,
        Command::Selftest(args) => commands::selftest::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", describe(&e));
            ExitCode::from(exit_status(&e))
        }
    }
}

/// Error chain, tagged with the core error code when there is one.
fn describe(err: &anyhow::Error) -> String {
    match err.downcast_ref::<fileportal_core::Error>().and_then(fileportal_core::Error::code) {
        Some(code) => format!("[{}] {:#}", code, err),
        None => format!("{:#}", err),
    }
}

/// Exit status: 2 when trying again on a new link may succeed, 1 otherwise.
fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<fileportal_core::Error>() {
        Some(e) if e.is_recoverable() => 2,
        _ => 1,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,fileportal=info,fileportal_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
