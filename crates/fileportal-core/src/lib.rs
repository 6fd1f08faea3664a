//! # FilePortal Core Library
//!
//! `fileportal-core` moves a single file between two peers over an
//! already-established set of ordered, reliable message channels.
//!
//! ## How it works
//!
//! - A link consists of `N` transfer channels (labels `0..N`) plus one
//!   `metadata` channel carrying JSON control messages.
//! - The sender splits the file into fixed-size chunks and sends chunk `i`
//!   on channel `i mod N`, strictly in ascending order.
//! - The receiver never sees a chunk index on the wire. It recovers the
//!   global order from the channel label and the per-channel arrival order.
//! - A small state machine negotiates consent (`start` / `accepted` /
//!   `denied`) and reports progress back to the sender.
//!
//! ## Modules
//!
//! - [`channel`] - Channel labels, messages, and the in-memory / TCP transports
//! - [`config`] - Configuration management
//! - [`distributor`] - Chunk splitting and round-robin dispatch
//! - [`pool`] - Channel pool: routing outgoing chunks, classifying inbound traffic
//! - [`protocol`] - Metadata messages and the TCP frame codec
//! - [`reassembler`] - Rebuilding the file from channel-tagged arrivals
//! - [`session`] - The transfer state machine
//! - [`ui`] - The user interface collaborator contract
//!
//! ## Example
//!
//! ```rust,ignore
//! use fileportal_core::channel::memory;
//! use fileportal_core::pool::ChannelPool;
//! use fileportal_core::session::Session;
//!
//! let (local, _remote) = memory::link(511, 64);
//! let (pool, events) = ChannelPool::new(local, 511)?;
//! let (session, handle) = Session::new(pool, events, ui, &config.transfer)?;
//! tokio::spawn(session.run());
//! handle.send_file("notes.txt", bytes).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod channel;
pub mod config;
pub mod distributor;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod reassembler;
pub mod session;
pub mod ui;

pub use error::{Error, ProtocolViolation, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for the TCP frame codec
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default chunk size (256 KiB). Larger messages are refused by common
/// data-channel implementations.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound accepted for the chunk size.
pub const MAX_CHUNK_SIZE: usize = DEFAULT_CHUNK_SIZE;

/// Default number of transfer channels (512 channels minus the metadata one).
pub const DEFAULT_CHANNEL_COUNT: u16 = 511;

/// Default bound of each channel's outgoing queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Default TCP port for the direct link.
pub const DEFAULT_PORT: u16 = 52530;

/// Label of the control channel.
pub const METADATA_LABEL: &str = "metadata";
