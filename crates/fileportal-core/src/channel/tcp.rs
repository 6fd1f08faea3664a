//! TCP transport: one TCP connection per channel.
//!
//! The connecting peer opens `N + 1` connections and identifies each one with
//! a `Hello` frame carrying its label. The listening peer accepts the same
//! number of connections and classifies them by that label. Afterwards every
//! channel message is a single `Text` or `Binary` frame (see
//! [`crate::protocol`]).
//!
//! TCP gives the per-channel ordering the reassembler relies on; nothing is
//! promised across connections.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{Channel, ChannelLabel, ChannelMessage};
use crate::error::{Error, Result};
use crate::protocol::{self, FrameType, HelloPayload};

/// Options for establishing a TCP link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Bound of each channel's queues
    pub queue_depth: usize,
    /// Time allowed for each connection and its `Hello` once the link is
    /// being established
    pub handshake_timeout: Duration,
    /// Enable OS-level TCP keep-alive
    pub keepalive: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            queue_depth: crate::DEFAULT_QUEUE_DEPTH,
            handshake_timeout: Duration::from_secs(10),
            keepalive: true,
        }
    }
}

/// Configure TCP keep-alive on a socket.
///
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    Ok(())
}

fn prepare_stream(stream: &TcpStream, options: &LinkOptions) -> Result<()> {
    stream.set_nodelay(true)?;
    if options.keepalive {
        configure_tcp_keepalive(stream)?;
    }
    Ok(())
}

fn protocol_version() -> String {
    format!(
        "{}.{}",
        crate::PROTOCOL_VERSION.0,
        crate::PROTOCOL_VERSION.1
    )
}

/// Create the channel set towards `addr` (the side that opens channels).
///
/// # Errors
///
/// Returns an error if any connection cannot be established or identified.
pub async fn connect(
    addr: SocketAddr,
    transfer_count: u16,
    options: &LinkOptions,
) -> Result<Vec<Channel>> {
    let mut channels = Vec::with_capacity(usize::from(transfer_count) + 1);

    for label in ChannelLabel::all(transfer_count) {
        let mut stream = timeout(options.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(options.handshake_timeout.as_secs()))??;
        prepare_stream(&stream, options)?;

        let hello = HelloPayload {
            label: label.to_string(),
            protocol_version: protocol_version(),
        };
        protocol::write_frame(
            &mut stream,
            FrameType::Hello,
            &protocol::encode_payload(&hello)?,
        )
        .await?;

        channels.push(spawn_io(stream, label, options.queue_depth));
    }

    tracing::info!(
        "Opened {} transfer channels + metadata to {}",
        transfer_count,
        addr
    );
    Ok(channels)
}

/// Accept a channel set on `listener` (the side that receives channels).
///
/// Waits indefinitely for the first connection; every later connection and
/// every `Hello` must arrive within the handshake timeout. Connections from a
/// different address than the first one are dropped.
///
/// # Errors
///
/// Returns an error on timeout, on an unknown or duplicate label, or on I/O
/// failure.
pub async fn accept(
    listener: &TcpListener,
    transfer_count: u16,
    options: &LinkOptions,
) -> Result<Vec<Channel>> {
    let expected = usize::from(transfer_count) + 1;
    let mut channels = Vec::with_capacity(expected);
    let mut seen = HashSet::with_capacity(expected);
    let mut peer_ip: Option<IpAddr> = None;

    while channels.len() < expected {
        let (mut stream, peer_addr) = if peer_ip.is_none() {
            listener.accept().await?
        } else {
            timeout(options.handshake_timeout, listener.accept())
                .await
                .map_err(|_| Error::Timeout(options.handshake_timeout.as_secs()))??
        };

        match peer_ip {
            None => {
                tracing::info!("Peer connecting from {}", peer_addr);
                peer_ip = Some(peer_addr.ip());
            }
            Some(ip) if ip != peer_addr.ip() => {
                tracing::warn!("Ignoring connection from unexpected peer {}", peer_addr);
                continue;
            }
            Some(_) => {}
        }

        prepare_stream(&stream, options)?;

        let label = read_hello(&mut stream, options.handshake_timeout).await?;
        if let ChannelLabel::Transfer(n) = label {
            if n >= transfer_count {
                return Err(Error::InvalidChannelSet(format!(
                    "channel {n} outside pool of {transfer_count}"
                )));
            }
        }
        if !seen.insert(label) {
            return Err(Error::InvalidChannelSet(format!(
                "channel '{label}' opened twice"
            )));
        }

        tracing::debug!("Channel '{}' established", label);
        channels.push(spawn_io(stream, label, options.queue_depth));
    }

    tracing::info!(
        "Accepted {} transfer channels + metadata",
        transfer_count
    );
    Ok(channels)
}

async fn read_hello(stream: &mut TcpStream, duration: Duration) -> Result<ChannelLabel> {
    let (header, payload) = protocol::read_frame_with_timeout(stream, duration).await?;
    if header.frame_type != FrameType::Hello {
        return Err(Error::InvalidFrame(format!(
            "expected Hello, got {:?}",
            header.frame_type
        )));
    }

    let hello: HelloPayload = protocol::decode_payload(&payload)?;
    hello.label.parse()
}

/// Bridge a connected stream onto channel queues.
fn spawn_io(stream: TcpStream, label: ChannelLabel, queue_depth: usize) -> Channel {
    let depth = queue_depth.max(1);
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(depth);
    let (in_tx, in_rx) = mpsc::channel(depth);

    tokio::spawn(write_loop(write_half, label, out_rx));
    tokio::spawn(read_loop(read_half, label, in_tx));

    Channel::new(label, out_tx, in_rx)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    label: ChannelLabel,
    mut outgoing: mpsc::Receiver<ChannelMessage>,
) {
    while let Some(message) = outgoing.recv().await {
        let result = match &message {
            ChannelMessage::Text(text) => {
                protocol::write_frame(&mut writer, FrameType::Text, text.as_bytes()).await
            }
            ChannelMessage::Binary(data) => {
                protocol::write_frame(&mut writer, FrameType::Binary, data).await
            }
        };

        if let Err(e) = result {
            tracing::error!("Channel '{}' send failed: {}", label, e);
            return;
        }
    }

    let _ = writer.shutdown().await;
}

async fn read_loop(
    reader: OwnedReadHalf,
    label: ChannelLabel,
    incoming: mpsc::Sender<Result<ChannelMessage>>,
) {
    let mut reader = BufReader::new(reader);

    loop {
        let message = match protocol::read_frame(&mut reader).await {
            Ok((header, payload)) => match header.frame_type {
                FrameType::Binary => Ok(ChannelMessage::Binary(payload)),
                FrameType::Text => String::from_utf8(payload)
                    .map(ChannelMessage::Text)
                    .map_err(|e| Error::Channel {
                        label,
                        reason: format!("invalid UTF-8 in text message: {e}"),
                    }),
                FrameType::Hello => {
                    tracing::warn!("Channel '{}' sent a second Hello, ignoring", label);
                    continue;
                }
            },
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Channel '{}' closed by peer", label);
                return;
            }
            Err(e) => {
                tracing::error!("Channel '{}' receive failed: {}", label, e);
                Err(Error::Channel {
                    label,
                    reason: e.to_string(),
                })
            }
        };

        let failed = message.is_err();
        if incoming.send(message).await.is_err() || failed {
            return;
        }
    }
}
