//! The user interface collaborator.
//!
//! The session never talks to a terminal, window or browser directly. It
//! asks a [`UserInterface`] for consent and file selection, and hands it
//! progress, notices and finished artifacts.
//!
//! `confirm` and `select_file` are asynchronous: the session runs them on
//! their own tasks and keeps processing channel traffic while the user
//! decides.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// A file picked for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    /// Name announced to the peer
    pub name: String,
    /// File contents
    pub data: Vec<u8>,
}

impl SelectedFile {
    /// Create a new selection.
    #[must_use]
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Our file reached the peer
    Sent {
        /// File name
        filename: String,
        /// Transfer time reported by the receiver
        elapsed: Duration,
    },
    /// We received and delivered a file
    Received {
        /// File name
        filename: String,
        /// Size in bytes
        bytes: usize,
        /// Time from acceptance to the last chunk
        elapsed: Duration,
    },
    /// The peer refused our offer
    Denied {
        /// File name
        filename: String,
    },
    /// We refused the peer's offer
    Declined {
        /// File name
        filename: String,
    },
    /// The transfer was cut short
    Aborted {
        /// File name
        filename: String,
        /// What happened
        reason: String,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent { filename, elapsed } => write!(
                f,
                "Transfer complete. '{filename}' was sent in {:.2} seconds",
                elapsed.as_secs_f64()
            ),
            Self::Received {
                filename,
                bytes,
                elapsed,
            } => write!(
                f,
                "Received '{filename}' ({bytes} bytes) in {:.2} seconds",
                elapsed.as_secs_f64()
            ),
            Self::Denied { filename } => {
                write!(f, "Transfer request for '{filename}' was denied")
            }
            Self::Declined { filename } => {
                write!(f, "Transfer request for '{filename}' declined")
            }
            Self::Aborted { filename, reason } => {
                write!(f, "Transfer of '{filename}' aborted: {reason}")
            }
        }
    }
}

/// What the session needs from the front-end.
pub trait UserInterface: Send + Sync + 'static {
    /// Ask the user whether to accept `filename`.
    fn confirm(&self, filename: &str) -> impl Future<Output = bool> + Send;

    /// Let the user pick a file to send; `None` if they cancelled.
    fn select_file(&self) -> impl Future<Output = Option<SelectedFile>> + Send;

    /// Progress of the current transfer, in chunks.
    fn show_progress(&self, value: u64, max: u64);

    /// A human-readable notice.
    fn notify(&self, message: &str);

    /// Hand a completed file to the user.
    fn deliver_artifact(&self, data: &[u8], filename: &str) -> Result<()>;

    /// A transfer ended.
    fn finished(&self, outcome: &Outcome) {
        self.notify(&outcome.to_string());
    }
}
