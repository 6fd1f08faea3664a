//! Error types for FilePortal.
//!
//! This module provides a unified error type for all FilePortal operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

use crate::channel::ChannelLabel;

/// A specialized `Result` type for FilePortal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for FilePortal.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport send/receive failure on a single channel (E001)
    #[error("channel '{label}' failed: {reason}")]
    Channel {
        /// The channel that failed
        label: ChannelLabel,
        /// What went wrong
        reason: String,
    },

    /// The peer link is gone (E002)
    #[error("connection to peer lost")]
    Disconnected,

    /// The remote peer violated the transfer protocol (E003)
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Transfer refused by the remote user
    #[error("transfer of '{0}' was denied by the remote peer")]
    TransferDenied(String),

    /// A transfer is already pending or running on this link
    #[error("a transfer is already in progress")]
    TransferActive,

    /// Channel label could not be parsed
    #[error("invalid channel label: {0}")]
    InvalidLabel(String),

    /// The channel set handed to the pool is incomplete or inconsistent
    #[error("invalid channel set: {0}")]
    InvalidChannelSet(String),

    /// Invalid frame on a framed transport
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Unsupported frame codec version
    #[error("unsupported protocol version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Artifact delivery failed in the user interface
    #[error("failed to deliver '{file}': {reason}")]
    DeliveryFailed {
        /// File name
        file: String,
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::Channel { .. } => Some("E001"),
            Self::Disconnected => Some("E002"),
            Self::Protocol(_) => Some("E003"),
            Self::TransferDenied(_) => Some("E004"),
            Self::TransferActive => Some("E005"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (a new transfer may succeed
    /// on the same link).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::TransferDenied(_) | Self::TransferActive | Self::Timeout(_)
        )
    }
}

/// Anomalies in what the remote peer sent.
///
/// These are reported as warnings; the in-flight transfer is left alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `start` received while a transfer is pending or running
    #[error("'start' for '{filename}' received while a transfer is in progress")]
    TransferInProgress {
        /// File name of the rejected request
        filename: String,
    },

    /// Chunk received with no receiving transfer active
    #[error("chunk received on channel {channel} with no active transfer")]
    NoActiveTransfer {
        /// Channel the chunk arrived on
        channel: u16,
    },

    /// A buffer slot was written twice
    #[error("slot {index} already filled (chunk on channel {channel})")]
    DuplicateSlot {
        /// Channel the chunk arrived on
        channel: u16,
        /// Slot that was already occupied
        index: u64,
    },

    /// A channel delivered more chunks than were assigned to it
    #[error("channel {channel} delivered chunk for slot {index} beyond total {total}")]
    ChannelOverrun {
        /// Channel the chunk arrived on
        channel: u16,
        /// Slot the chunk would have filled
        index: u64,
        /// Total chunks of the transfer
        total: u64,
    },

    /// Chunk larger than the configured chunk size
    #[error("chunk of {size} bytes on channel {channel} exceeds limit of {limit} bytes")]
    OversizedChunk {
        /// Channel the chunk arrived on
        channel: u16,
        /// Received size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// A chunk arrived on a channel label outside the pool
    #[error("chunk on unknown channel {channel}")]
    UnknownChannel {
        /// Channel label
        channel: u16,
    },

    /// `start` announced more chunks than a receiver will allocate for
    #[error("'{filename}' announces {total} chunks, limit is {limit}")]
    TooManyChunks {
        /// File name of the rejected request
        filename: String,
        /// Announced chunk count
        total: u64,
        /// Largest accepted chunk count
        limit: u64,
    },

    /// Control message not valid in the current state
    #[error("unexpected '{event}' while {state}")]
    UnexpectedMessage {
        /// The metadata event received
        event: &'static str,
        /// Current transfer state
        state: &'static str,
    },
}
