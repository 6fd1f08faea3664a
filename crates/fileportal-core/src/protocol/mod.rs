//! FilePortal wire protocol.
//!
//! Two layers live here:
//!
//! 1. **Metadata messages** travel on the `metadata` channel as one JSON
//!    object per message:
//!
//!    ```text
//!    {"event":"start","filename":"a.txt","bufferSize":10}
//!    {"event":"accepted"}
//!    {"event":"denied"}
//!    {"event":"progress","value":4}
//!    {"event":"progress","value":0,"timeElapsed":1.25}
//!    ```
//!
//!    `bufferSize` is the total chunk count. A `progress` with `value` 0 is
//!    the completion signal.
//!
//! 2. **Frames** are used by the TCP transport to carry channel messages over
//!    a byte stream:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      FPRT Frame                            │
//! ├────────────┬────────────┬────────────┬─────────────────────┤
//! │   Magic    │  Version   │    Type    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │      4 bytes        │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x46 0x50 0x52 0x54` ("FPRT")
//! - Version: `0x01 0x00` (1.0)
//! - Type: Frame type byte
//! - Length: Payload length in bytes (big-endian)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Frame magic bytes: "FPRT"
pub const MAGIC: [u8; 4] = [0x46, 0x50, 0x52, 0x54];

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Maximum payload size (1 MB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Control message exchanged on the metadata channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MetadataMessage {
    /// Request to send a file
    Start {
        /// Name of the offered file
        filename: String,
        /// Number of chunks the file will be split into
        #[serde(rename = "bufferSize")]
        total_chunks: u64,
    },
    /// Receiver consented; sender may start dispatching
    Accepted,
    /// Receiver refused the transfer
    Denied,
    /// Receiver progress; `value == 0` signals completion
    Progress {
        /// Chunks received so far, or 0 on completion
        value: u64,
        /// Seconds from acceptance to completion
        #[serde(
            rename = "timeElapsed",
            skip_serializing_if = "Option::is_none",
            default
        )]
        time_elapsed: Option<f64>,
    },
}

impl MetadataMessage {
    /// Progress update for `count` received chunks.
    #[must_use]
    pub const fn progress(count: u64) -> Self {
        Self::Progress {
            value: count,
            time_elapsed: None,
        }
    }

    /// Completion signal carrying the elapsed transfer time.
    #[must_use]
    pub fn completion(elapsed: Duration) -> Self {
        Self::Progress {
            value: 0,
            time_elapsed: Some(elapsed.as_secs_f64()),
        }
    }

    /// Whether this is the completion signal.
    #[must_use]
    pub const fn is_completion(&self) -> bool {
        matches!(self, Self::Progress { value: 0, .. })
    }

    /// The `event` tag as it appears on the wire.
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Accepted => "accepted",
            Self::Denied => "denied",
            Self::Progress { .. } => "progress",
        }
    }

    /// Encode to a JSON text message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a JSON text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid metadata message.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Frame types of the TCP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Channel identification, first frame on every connection
    Hello = 0x01,
    /// Text channel message
    Text = 0x02,
    /// Binary channel message
    Binary = 0x03,
}

impl FrameType {
    /// Parse a frame type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Text),
            0x03 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// A frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Frame type
    pub frame_type: FrameType,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.frame_type as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::InvalidFrame("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != crate::PROTOCOL_VERSION.0 {
            return Err(Error::UnsupportedVersion {
                major: version.0,
                minor: version.1,
            });
        }

        let frame_type = FrameType::from_byte(buf[6])
            .ok_or_else(|| Error::InvalidFrame(format!("unknown frame type: {:#x}", buf[6])))?;

        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidFrame(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            version,
            frame_type,
            payload_length,
        })
    }
}

/// Hello frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Channel label (`"metadata"` or a transfer channel number)
    pub label: String,
    /// Protocol version string
    pub protocol_version: String,
}

/// Encode a frame payload to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a frame payload from JSON bytes.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Read a complete frame from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>)>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok((header, payload))
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if writing fails or the payload is too large.
pub async fn write_frame<W>(writer: &mut W, frame_type: FrameType, payload: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidFrame(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        version: crate::PROTOCOL_VERSION,
        frame_type,
        payload_length: payload.len() as u32,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read a complete frame from a stream with a timeout.
///
/// # Errors
///
/// Returns `Error::Timeout` if the operation exceeds the specified duration.
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame_with_timeout<R>(
    reader: &mut R,
    duration: Duration,
) -> Result<(FrameHeader, Vec<u8>)>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    timeout(duration, read_frame(reader))
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}
