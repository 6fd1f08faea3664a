//! Transfer state machine.
//!
//! A [`Session`] owns one peer link (a [`ChannelPool`] and its event queue)
//! and drives at most one transfer at a time through
//! `Idle -> AwaitingConsent -> Transferring -> Idle`, in either role.
//!
//! `run()` is the only consumer of channel traffic and the only place the
//! transfer is mutated. Everything slow happens on spawned tasks that report
//! back through an internal queue:
//!
//! - the user's consent (`UserInterface::confirm`)
//! - file selection (`UserInterface::select_file`)
//! - chunk dispatch ([`Distributor::dispatch`])
//!
//! Callers drive the session through a cloneable [`SessionHandle`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let (session, handle) = Session::new(pool, events, ui, &config.transfer)?;
//! let task = tokio::spawn(session.run());
//!
//! handle.send_file("notes.txt", bytes).await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::ChannelLabel;
use crate::config::TransferConfig;
use crate::distributor::{self, Distributor};
use crate::error::{Error, ProtocolViolation, Result};
use crate::pool::{ChannelPool, PoolEvent};
use crate::protocol::MetadataMessage;
use crate::reassembler::{Arrival, Artifact, Reassembler, MAX_TOTAL_CHUNKS};
use crate::ui::{Outcome, SelectedFile, UserInterface};

const COMMAND_QUEUE_DEPTH: usize = 16;

/// Phase of the transfer on this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer
    Idle,
    /// A `start` was sent or received and the receiver has not answered yet
    AwaitingConsent,
    /// Chunks are flowing
    Transferring,
}

impl TransferState {
    /// Short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingConsent => "awaiting consent",
            Self::Transferring => "transferring",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the transfer this peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Offering a file
    Sender,
    /// Being offered a file
    Receiver,
}

/// Snapshot of the transfer, published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    /// Current phase
    pub state: TransferState,
    /// Our role, `None` when idle
    pub role: Option<Role>,
    /// File being transferred
    pub filename: Option<String>,
    /// Chunks received (as reported by the receiver when sending)
    pub progress: u64,
    /// Total chunks of the file
    pub total_chunks: u64,
}

impl TransferStatus {
    fn idle() -> Self {
        Self {
            state: TransferState::Idle,
            role: None,
            filename: None,
            progress: 0,
            total_chunks: 0,
        }
    }
}

struct Outgoing {
    id: Uuid,
    filename: String,
    total_chunks: u64,
    data: Arc<Vec<u8>>,
    acked: u64,
    started_at: Instant,
    dispatch: Option<JoinHandle<()>>,
}

enum Transfer {
    Idle,
    Offering(Outgoing),
    Sending(Outgoing),
    Consenting {
        id: Uuid,
        filename: String,
        total_chunks: u64,
        prompt: JoinHandle<()>,
    },
    Receiving(Reassembler),
}

impl Transfer {
    fn describe(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Offering(_) => "offering a file",
            Self::Sending(_) => "sending",
            Self::Consenting { .. } => "awaiting consent",
            Self::Receiving(_) => "receiving",
        }
    }
}

enum Command {
    SendFile {
        file: SelectedFile,
        reply: oneshot::Sender<Result<bool>>,
    },
    RequestSend {
        reply: oneshot::Sender<Result<bool>>,
    },
    Shutdown,
}

enum Internal {
    ConsentResolved {
        id: Uuid,
        accepted: bool,
    },
    FileSelected {
        file: Option<SelectedFile>,
        reply: oneshot::Sender<Result<bool>>,
    },
    DispatchFinished {
        id: Uuid,
        result: Result<u64>,
    },
}

/// Control surface of a running [`Session`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<TransferStatus>,
}

impl SessionHandle {
    /// Offer a file to the peer.
    ///
    /// Returns once the `start` request is on the wire; the outcome is
    /// reported to the UI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferActive`] if a transfer is pending or running,
    /// [`Error::Channel`] if the link has a failed channel, or
    /// [`Error::Disconnected`] if the session has ended.
    pub async fn send_file(&self, name: impl Into<String>, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let file = SelectedFile::new(name, data);
        self.request(Command::SendFile { file, reply }, rx)
            .await
            .map(|_| ())
    }

    /// Ask the UI for a file and offer it to the peer.
    ///
    /// Returns `false` if the user picked nothing.
    ///
    /// # Errors
    ///
    /// Same as [`SessionHandle::send_file`].
    pub async fn request_send(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::RequestSend { reply }, rx).await
    }

    /// Current transfer snapshot.
    #[must_use]
    pub fn state(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.clone()
    }

    /// Stop the session, aborting any transfer in flight.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<bool>>,
    ) -> Result<bool> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Disconnected)?;
        reply.await.map_err(|_| Error::Disconnected)?
    }
}

/// The transfer state machine for one peer link.
pub struct Session<U> {
    pool: ChannelPool,
    events: mpsc::Receiver<PoolEvent>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    ui: Arc<U>,
    distributor: Distributor,
    transfer: Transfer,
    status: watch::Sender<TransferStatus>,
}

impl<U> fmt::Debug for Session<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("transfer_count", &self.pool.transfer_count())
            .field("chunk_size", &self.distributor.chunk_size())
            .field("state", &self.transfer.describe())
            .finish_non_exhaustive()
    }
}

impl<U: UserInterface> Session<U> {
    /// Create a session over `pool`. `events` must be the queue returned by
    /// [`ChannelPool::new`] for that pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the chunk size is zero.
    pub fn new(
        pool: ChannelPool,
        events: mpsc::Receiver<PoolEvent>,
        ui: Arc<U>,
        config: &TransferConfig,
    ) -> Result<(Self, SessionHandle)> {
        let distributor = Distributor::new(pool.clone(), config.chunk_size)?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (internal_tx, internal_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(TransferStatus::idle());

        let session = Self {
            pool,
            events,
            commands: commands_rx,
            internal_tx,
            internal_rx,
            ui,
            distributor,
            transfer: Transfer::Idle,
            status: status_tx,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            status: status_rx,
        };

        Ok((session, handle))
    }

    /// Process channel traffic, commands and task results until the peer
    /// disconnects or [`SessionHandle::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when the metadata channel is lost.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            "Session running over {} transfer channels",
            self.pool.transfer_count()
        );
        let mut commands_open = true;

        loop {
            let result = tokio::select! {
                biased;

                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Shutdown) => {
                        self.abort("session closed");
                        tracing::info!("Session shut down");
                        return Ok(());
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        commands_open = false;
                        Ok(())
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => Err(Error::Disconnected),
                },
            };

            if let Err(e) = result {
                self.on_failure(e)?;
            }
        }
    }

    fn on_failure(&mut self, error: Error) -> Result<()> {
        match error {
            Error::Disconnected
            | Error::Channel {
                label: ChannelLabel::Metadata,
                ..
            } => {
                tracing::error!("Connection to peer lost");
                self.abort("connection to peer lost");
                Err(Error::Disconnected)
            }
            e => {
                tracing::error!("Transfer failed: {}", e);
                self.abort(&e.to_string());
                Ok(())
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SendFile { file, reply } => {
                let outcome = self.start_send(file).await;
                settle(reply, outcome)
            }
            Command::RequestSend { reply } => {
                if !matches!(self.transfer, Transfer::Idle) {
                    let _ = reply.send(Err(Error::TransferActive));
                    return Ok(());
                }

                let ui = Arc::clone(&self.ui);
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let file = ui.select_file().await;
                    let _ = internal.send(Internal::FileSelected { file, reply }).await;
                });
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn on_internal(&mut self, internal: Internal) -> Result<()> {
        match internal {
            Internal::ConsentResolved { id, accepted } => self.on_consent(id, accepted).await,
            Internal::FileSelected { file: None, reply } => {
                tracing::debug!("No file selected");
                let _ = reply.send(Ok(false));
                Ok(())
            }
            Internal::FileSelected {
                file: Some(file),
                reply,
            } => {
                let outcome = self.start_send(file).await;
                settle(reply, outcome)
            }
            Internal::DispatchFinished { id, result } => match result {
                Ok(sent) => {
                    tracing::debug!("Dispatched {} chunks", sent);
                    Ok(())
                }
                Err(e) if matches!(&self.transfer, Transfer::Sending(o) if o.id == id) => Err(e),
                Err(e) => {
                    tracing::debug!("Dispatch of an ended transfer failed: {}", e);
                    Ok(())
                }
            },
        }
    }

    async fn on_event(&mut self, event: PoolEvent) -> Result<()> {
        match event {
            PoolEvent::Metadata(message) => self.on_metadata(message).await,
            PoolEvent::Chunk { channel, data } => self.on_chunk(channel, data).await,
            PoolEvent::ChannelLost {
                label: ChannelLabel::Metadata,
                ..
            } => Err(Error::Disconnected),
            PoolEvent::ChannelLost { label, error } => {
                let reason = error.map_or_else(|| "closed".to_string(), |e| e.to_string());
                if matches!(self.transfer, Transfer::Idle) {
                    tracing::debug!("Channel '{}' lost while idle: {}", label, reason);
                    return Ok(());
                }
                Err(Error::Channel { label, reason })
            }
        }
    }

    /// Outer error ends the session; inner error goes back to the caller.
    async fn start_send(&mut self, file: SelectedFile) -> Result<Result<bool>> {
        if !matches!(self.transfer, Transfer::Idle) {
            return Ok(Err(Error::TransferActive));
        }
        if let Some(label) = self.pool.failed_channel() {
            return Ok(Err(Error::Channel {
                label,
                reason: "channel has failed".to_string(),
            }));
        }

        let SelectedFile { name, data } = file;
        let total_chunks = distributor::total_chunks(data.len(), self.distributor.chunk_size());

        self.pool
            .send_metadata(&MetadataMessage::Start {
                filename: name.clone(),
                total_chunks,
            })
            .await?;

        tracing::info!(
            "Offering '{}' ({} bytes, {} chunks)",
            name,
            data.len(),
            total_chunks
        );
        self.transfer = Transfer::Offering(Outgoing {
            id: Uuid::new_v4(),
            filename: name,
            total_chunks,
            data: Arc::new(data),
            acked: 0,
            started_at: Instant::now(),
            dispatch: None,
        });
        self.publish();

        Ok(Ok(true))
    }

    async fn on_metadata(&mut self, message: MetadataMessage) -> Result<()> {
        match message {
            MetadataMessage::Start {
                filename,
                total_chunks,
            } => self.on_start(filename, total_chunks).await,
            MetadataMessage::Accepted => {
                self.on_accepted();
                Ok(())
            }
            MetadataMessage::Denied => {
                self.on_denied();
                Ok(())
            }
            MetadataMessage::Progress {
                value,
                time_elapsed,
            } => {
                self.on_progress(value, time_elapsed);
                Ok(())
            }
        }
    }

    async fn on_start(&mut self, filename: String, total_chunks: u64) -> Result<()> {
        if !matches!(self.transfer, Transfer::Idle) {
            report(ProtocolViolation::TransferInProgress { filename });
            return self.pool.send_metadata(&MetadataMessage::Denied).await;
        }
        if let Some(label) = self.pool.failed_channel() {
            tracing::warn!(
                "Refusing '{}': channel '{}' has failed",
                filename,
                label
            );
            return self.pool.send_metadata(&MetadataMessage::Denied).await;
        }
        if total_chunks > MAX_TOTAL_CHUNKS {
            report(ProtocolViolation::TooManyChunks {
                filename,
                total: total_chunks,
                limit: MAX_TOTAL_CHUNKS,
            });
            return self.pool.send_metadata(&MetadataMessage::Denied).await;
        }

        tracing::info!(
            "Incoming transfer request for '{}' ({} chunks)",
            filename,
            total_chunks
        );
        let id = Uuid::new_v4();
        let ui = Arc::clone(&self.ui);
        let internal = self.internal_tx.clone();
        let asked = filename.clone();
        let prompt = tokio::spawn(async move {
            let accepted = ui.confirm(&asked).await;
            let _ = internal
                .send(Internal::ConsentResolved { id, accepted })
                .await;
        });

        self.transfer = Transfer::Consenting {
            id,
            filename,
            total_chunks,
            prompt,
        };
        self.publish();
        Ok(())
    }

    async fn on_consent(&mut self, id: Uuid, accepted: bool) -> Result<()> {
        match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Consenting {
                id: pending,
                filename,
                total_chunks,
                ..
            } if pending == id => {
                if !accepted {
                    tracing::info!("Declined '{}'", filename);
                    self.ui.finished(&Outcome::Declined { filename });
                    self.publish();
                    return self.pool.send_metadata(&MetadataMessage::Denied).await;
                }

                let mut reassembler = match Reassembler::new(
                    filename.clone(),
                    total_chunks,
                    self.pool.transfer_count(),
                    crate::MAX_CHUNK_SIZE,
                ) {
                    Ok(reassembler) => reassembler,
                    Err(e) => {
                        tracing::warn!("Refusing '{}': {}", filename, e);
                        self.ui.finished(&Outcome::Aborted {
                            filename,
                            reason: e.to_string(),
                        });
                        self.publish();
                        return self.pool.send_metadata(&MetadataMessage::Denied).await;
                    }
                };
                self.pool.send_metadata(&MetadataMessage::Accepted).await?;
                tracing::info!(
                    "Accepted '{}' (transfer {})",
                    reassembler.filename(),
                    reassembler.id()
                );
                self.ui.show_progress(0, total_chunks);

                if let Some(artifact) = reassembler.try_finish() {
                    return self.complete(artifact).await;
                }
                self.transfer = Transfer::Receiving(reassembler);
                self.publish();
                Ok(())
            }
            other => {
                tracing::debug!("Ignoring consent for an ended request");
                self.transfer = other;
                Ok(())
            }
        }
    }

    fn on_accepted(&mut self) {
        match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Offering(mut outgoing) => {
                tracing::info!(
                    "'{}' accepted, sending {} chunks",
                    outgoing.filename,
                    outgoing.total_chunks
                );
                self.ui.notify(&format!(
                    "Transfer request for '{}' was accepted",
                    outgoing.filename
                ));

                let distributor = self.distributor.clone();
                let data = Arc::clone(&outgoing.data);
                let internal = self.internal_tx.clone();
                let id = outgoing.id;
                outgoing.started_at = Instant::now();
                outgoing.dispatch = Some(tokio::spawn(async move {
                    let result = distributor.dispatch(&data).await;
                    let _ = internal
                        .send(Internal::DispatchFinished { id, result })
                        .await;
                }));

                self.transfer = Transfer::Sending(outgoing);
                self.publish();
            }
            other => {
                self.transfer = other;
                self.unexpected("accepted");
            }
        }
    }

    fn on_denied(&mut self) {
        match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Offering(outgoing) => {
                tracing::info!("'{}' was denied by the peer", outgoing.filename);
                self.ui.finished(&Outcome::Denied {
                    filename: outgoing.filename,
                });
                self.publish();
            }
            other => {
                self.transfer = other;
                self.unexpected("denied");
            }
        }
    }

    fn on_progress(&mut self, value: u64, time_elapsed: Option<f64>) {
        let Transfer::Sending(outgoing) = &mut self.transfer else {
            self.unexpected("progress");
            return;
        };

        if value > 0 {
            outgoing.acked = value.min(outgoing.total_chunks);
            let total = outgoing.total_chunks;
            self.ui.show_progress(value, total);
            self.publish();
            return;
        }

        let elapsed = time_elapsed
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_else(|| outgoing.started_at.elapsed());
        let filename = std::mem::take(&mut outgoing.filename);

        tracing::info!(
            "'{}' delivered in {:.2}s",
            filename,
            elapsed.as_secs_f64()
        );
        self.transfer = Transfer::Idle;
        self.ui.finished(&Outcome::Sent { filename, elapsed });
        self.publish();
    }

    async fn on_chunk(&mut self, channel: u16, data: Vec<u8>) -> Result<()> {
        let Transfer::Receiving(reassembler) = &mut self.transfer else {
            report(ProtocolViolation::NoActiveTransfer { channel });
            return Ok(());
        };

        let total = reassembler.total_chunks();
        match reassembler.accept(channel, data) {
            Ok(Arrival::Progress(received)) => {
                self.pool
                    .send_metadata(&MetadataMessage::progress(received))
                    .await?;
                self.ui.show_progress(received, total);
                self.publish();
                Ok(())
            }
            Ok(Arrival::Complete(artifact)) => {
                self.pool
                    .send_metadata(&MetadataMessage::progress(total))
                    .await?;
                self.ui.show_progress(total, total);
                self.complete(artifact).await
            }
            Err(violation) => {
                report(violation);
                Ok(())
            }
        }
    }

    /// The outcome reaches the UI before the `Idle` status is published.
    async fn complete(&mut self, artifact: Artifact) -> Result<()> {
        self.transfer = Transfer::Idle;

        let Artifact {
            filename,
            data,
            elapsed,
        } = artifact;
        let delivered = self.ui.deliver_artifact(&data, &filename);
        let acknowledged = self
            .pool
            .send_metadata(&MetadataMessage::completion(elapsed))
            .await;

        let outcome = match delivered {
            Ok(()) => {
                tracing::info!(
                    "Received '{}' ({} bytes) in {:.2}s",
                    filename,
                    data.len(),
                    elapsed.as_secs_f64()
                );
                Outcome::Received {
                    filename,
                    bytes: data.len(),
                    elapsed,
                }
            }
            Err(e) => {
                tracing::error!("Failed to deliver '{}': {}", filename, e);
                Outcome::Aborted {
                    filename,
                    reason: e.to_string(),
                }
            }
        };
        self.ui.finished(&outcome);
        self.publish();
        acknowledged
    }

    fn abort(&mut self, reason: &str) {
        let filename = match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Idle => return,
            Transfer::Offering(outgoing) | Transfer::Sending(outgoing) => {
                if let Some(task) = outgoing.dispatch {
                    task.abort();
                }
                outgoing.filename
            }
            Transfer::Consenting {
                filename, prompt, ..
            } => {
                prompt.abort();
                filename
            }
            Transfer::Receiving(reassembler) => reassembler.filename().to_string(),
        };

        tracing::warn!("Transfer of '{}' aborted: {}", filename, reason);
        self.ui.finished(&Outcome::Aborted {
            filename,
            reason: reason.to_string(),
        });
        self.publish();
    }

    fn publish(&self) {
        let status = match &self.transfer {
            Transfer::Idle => TransferStatus::idle(),
            Transfer::Offering(o) => TransferStatus {
                state: TransferState::AwaitingConsent,
                role: Some(Role::Sender),
                filename: Some(o.filename.clone()),
                progress: 0,
                total_chunks: o.total_chunks,
            },
            Transfer::Sending(o) => TransferStatus {
                state: TransferState::Transferring,
                role: Some(Role::Sender),
                filename: Some(o.filename.clone()),
                progress: o.acked,
                total_chunks: o.total_chunks,
            },
            Transfer::Consenting {
                filename,
                total_chunks,
                ..
            } => TransferStatus {
                state: TransferState::AwaitingConsent,
                role: Some(Role::Receiver),
                filename: Some(filename.clone()),
                progress: 0,
                total_chunks: *total_chunks,
            },
            Transfer::Receiving(r) => TransferStatus {
                state: TransferState::Transferring,
                role: Some(Role::Receiver),
                filename: Some(r.filename().to_string()),
                progress: r.received(),
                total_chunks: r.total_chunks(),
            },
        };
        self.status.send_replace(status);
    }

    fn unexpected(&self, event: &'static str) {
        report(ProtocolViolation::UnexpectedMessage {
            event,
            state: self.transfer.describe(),
        });
    }
}

fn report(violation: ProtocolViolation) {
    tracing::warn!("{}", Error::from(violation));
}

fn settle(reply: oneshot::Sender<Result<bool>>, outcome: Result<Result<bool>>) -> Result<()> {
    match outcome {
        Ok(result) => {
            let _ = reply.send(result);
            Ok(())
        }
        Err(e) => {
            let _ = reply.send(Err(Error::Disconnected));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory, Channel, ChannelMessage};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    enum UiEvent {
        Confirm(String),
        Delivered(String, Vec<u8>),
        Finished(Outcome),
    }

    struct TestUi {
        accept: bool,
        selection: Option<SelectedFile>,
        events: mpsc::UnboundedSender<UiEvent>,
    }

    impl UserInterface for TestUi {
        async fn confirm(&self, filename: &str) -> bool {
            let _ = self.events.send(UiEvent::Confirm(filename.to_string()));
            self.accept
        }

        async fn select_file(&self) -> Option<SelectedFile> {
            self.selection.clone()
        }

        fn show_progress(&self, _value: u64, _max: u64) {}

        fn notify(&self, _message: &str) {}

        fn deliver_artifact(&self, data: &[u8], filename: &str) -> Result<()> {
            let _ = self
                .events
                .send(UiEvent::Delivered(filename.to_string(), data.to_vec()));
            Ok(())
        }

        fn finished(&self, outcome: &Outcome) {
            let _ = self.events.send(UiEvent::Finished(outcome.clone()));
        }
    }

    struct Harness {
        handle: SessionHandle,
        task: JoinHandle<Result<()>>,
        metadata: Channel,
        transfer: Vec<Channel>,
        ui: mpsc::UnboundedReceiver<UiEvent>,
    }

    fn start(accept: bool, selection: Option<SelectedFile>, n: u16, chunk_size: usize) -> Harness {
        let (local, mut remote) = memory::link(n, 16);
        let (pool, events) = ChannelPool::new(local, n).expect("pool");
        let (tx, rx) = mpsc::unbounded_channel();
        let ui = Arc::new(TestUi {
            accept,
            selection,
            events: tx,
        });
        let config = TransferConfig {
            chunk_size,
            ..TransferConfig::default()
        };
        let (session, handle) = Session::new(pool, events, ui, &config).expect("session");
        let task = tokio::spawn(session.run());

        remote.sort_by_key(Channel::label);
        let transfer = remote.split_off(1);
        let metadata = remote.pop().expect("metadata channel");

        Harness {
            handle,
            task,
            metadata,
            transfer,
            ui: rx,
        }
    }

    impl Harness {
        async fn send(&self, message: MetadataMessage) {
            let text = message.encode().expect("encode");
            self.metadata
                .send(ChannelMessage::Text(text))
                .await
                .expect("send metadata");
        }

        async fn chunk(&self, channel: u16, data: Vec<u8>) {
            self.transfer[usize::from(channel)]
                .send(ChannelMessage::Binary(data))
                .await
                .expect("send chunk");
        }

        async fn expect_metadata(&mut self) -> MetadataMessage {
            let message = tokio::time::timeout(WAIT, self.metadata.recv())
                .await
                .expect("metadata in time")
                .expect("channel open")
                .expect("no transport error");
            match message {
                ChannelMessage::Text(text) => MetadataMessage::decode(&text).expect("decode"),
                ChannelMessage::Binary(_) => panic!("binary on metadata channel"),
            }
        }

        async fn expect_ui(&mut self) -> UiEvent {
            tokio::time::timeout(WAIT, self.ui.recv())
                .await
                .expect("ui event in time")
                .expect("ui open")
        }
    }

    #[tokio::test]
    async fn test_denied_offer_sends_no_chunks() {
        let mut h = start(true, None, 3, 4);

        h.handle.send_file("a.txt", vec![7; 40]).await.expect("offer");
        assert_eq!(
            h.expect_metadata().await,
            MetadataMessage::Start {
                filename: "a.txt".to_string(),
                total_chunks: 10
            }
        );
        let status = h.handle.state();
        assert_eq!(status.state, TransferState::AwaitingConsent);
        assert_eq!(status.role, Some(Role::Sender));

        h.send(MetadataMessage::Denied).await;
        match h.expect_ui().await {
            UiEvent::Finished(Outcome::Denied { filename }) => assert_eq!(filename, "a.txt"),
            other => panic!("unexpected ui event: {other:?}"),
        }
        assert_eq!(h.handle.state().state, TransferState::Idle);

        for channel in &mut h.transfer {
            let quiet = tokio::time::timeout(Duration::from_millis(50), channel.recv()).await;
            assert!(quiet.is_err(), "chunk sent after denial");
        }
    }

    #[tokio::test]
    async fn test_duplicate_start_is_denied_without_disturbing_transfer() {
        let mut h = start(true, None, 2, 4);

        h.send(MetadataMessage::Start {
            filename: "f.bin".to_string(),
            total_chunks: 3,
        })
        .await;
        assert!(matches!(h.expect_ui().await, UiEvent::Confirm(name) if name == "f.bin"));
        assert_eq!(h.expect_metadata().await, MetadataMessage::Accepted);

        h.chunk(0, vec![0]).await;
        assert_eq!(h.expect_metadata().await, MetadataMessage::progress(1));

        h.send(MetadataMessage::Start {
            filename: "g.bin".to_string(),
            total_chunks: 5,
        })
        .await;
        assert_eq!(h.expect_metadata().await, MetadataMessage::Denied);
        assert_eq!(h.handle.state().filename.as_deref(), Some("f.bin"));

        h.chunk(1, vec![1]).await;
        assert_eq!(h.expect_metadata().await, MetadataMessage::progress(2));
        h.chunk(0, vec![2]).await;
        assert_eq!(h.expect_metadata().await, MetadataMessage::progress(3));
        assert!(h.expect_metadata().await.is_completion());

        match h.expect_ui().await {
            UiEvent::Delivered(name, data) => {
                assert_eq!(name, "f.bin");
                assert_eq!(data, vec![0, 1, 2]);
            }
            other => panic!("unexpected ui event: {other:?}"),
        }
        assert!(matches!(
            h.expect_ui().await,
            UiEvent::Finished(Outcome::Received { bytes: 3, .. })
        ));
        assert_eq!(h.handle.state().state, TransferState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_outcome_reaches_ui_before_idle_is_published() {
        for _ in 0..25 {
            let mut h = start(true, None, 1, 4);
            let mut status = h.handle.subscribe();

            h.handle.send_file("x.bin", vec![5; 4]).await.expect("offer");
            assert!(matches!(
                h.expect_metadata().await,
                MetadataMessage::Start { .. }
            ));
            h.send(MetadataMessage::Accepted).await;
            let chunk = tokio::time::timeout(WAIT, h.transfer[0].recv())
                .await
                .expect("chunk in time");
            assert!(chunk.is_some());
            h.send(MetadataMessage::completion(Duration::from_millis(100)))
                .await;

            tokio::time::timeout(WAIT, async {
                status
                    .wait_for(|s| s.state == TransferState::Idle)
                    .await
                    .map(|_| ())
            })
            .await
            .expect("idle in time")
            .expect("session alive");

            assert!(matches!(
                h.ui.try_recv(),
                Ok(UiEvent::Finished(Outcome::Sent { .. }))
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_denial_reaches_ui_before_idle_is_published() {
        for _ in 0..25 {
            let mut h = start(true, None, 1, 4);
            let mut status = h.handle.subscribe();

            h.handle.send_file("y.bin", vec![1; 8]).await.expect("offer");
            let _ = h.expect_metadata().await;
            h.send(MetadataMessage::Denied).await;

            tokio::time::timeout(WAIT, async {
                status
                    .wait_for(|s| s.state == TransferState::Idle)
                    .await
                    .map(|_| ())
            })
            .await
            .expect("idle in time")
            .expect("session alive");

            assert!(matches!(
                h.ui.try_recv(),
                Ok(UiEvent::Finished(Outcome::Denied { .. }))
            ));
        }
    }

    #[tokio::test]
    async fn test_stray_chunk_is_dropped() {
        let mut h = start(true, None, 1, 4);

        h.chunk(0, vec![0xEE]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.send(MetadataMessage::Start {
            filename: "one.bin".to_string(),
            total_chunks: 1,
        })
        .await;
        assert!(matches!(h.expect_ui().await, UiEvent::Confirm(_)));
        assert_eq!(h.expect_metadata().await, MetadataMessage::Accepted);

        h.chunk(0, vec![0x01]).await;
        match h.expect_ui().await {
            UiEvent::Delivered(_, data) => assert_eq!(data, vec![0x01]),
            other => panic!("unexpected ui event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_declined_request_is_denied() {
        let mut h = start(false, None, 2, 4);

        h.send(MetadataMessage::Start {
            filename: "no.txt".to_string(),
            total_chunks: 2,
        })
        .await;
        assert!(matches!(h.expect_ui().await, UiEvent::Confirm(_)));
        assert_eq!(h.expect_metadata().await, MetadataMessage::Denied);
        assert!(matches!(
            h.expect_ui().await,
            UiEvent::Finished(Outcome::Declined { .. })
        ));
        assert_eq!(h.handle.state().state, TransferState::Idle);
    }

    #[tokio::test]
    async fn test_oversized_request_is_denied_without_asking() {
        let mut h = start(true, None, 2, 4);

        h.send(MetadataMessage::Start {
            filename: "huge.iso".to_string(),
            total_chunks: MAX_TOTAL_CHUNKS + 1,
        })
        .await;
        assert_eq!(h.expect_metadata().await, MetadataMessage::Denied);
        assert!(h.ui.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_send_while_busy_fails() {
        let mut h = start(true, None, 2, 4);

        h.handle.send_file("first", vec![1; 8]).await.expect("offer");
        let _ = h.expect_metadata().await;

        assert!(matches!(
            h.handle.send_file("second", vec![2; 8]).await,
            Err(Error::TransferActive)
        ));
        assert!(matches!(
            h.handle.request_send().await,
            Err(Error::TransferActive)
        ));
        assert_eq!(h.handle.state().filename.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_unexpected_control_messages_are_ignored() {
        let mut h = start(true, None, 1, 4);

        h.send(MetadataMessage::Accepted).await;
        h.send(MetadataMessage::progress(3)).await;
        h.send(MetadataMessage::Denied).await;
        h.send(MetadataMessage::Start {
            filename: "after.txt".to_string(),
            total_chunks: 1,
        })
        .await;

        assert!(matches!(h.expect_ui().await, UiEvent::Confirm(name) if name == "after.txt"));
        assert_eq!(h.expect_metadata().await, MetadataMessage::Accepted);
    }

    #[tokio::test]
    async fn test_request_send_asks_ui_for_file() {
        let selection = SelectedFile::new("picked.txt", b"hello".to_vec());
        let mut h = start(true, Some(selection), 2, 4);

        assert!(h.handle.request_send().await.expect("request"));
        assert_eq!(
            h.expect_metadata().await,
            MetadataMessage::Start {
                filename: "picked.txt".to_string(),
                total_chunks: 2
            }
        );

        let mut nothing = start(true, None, 2, 4);
        assert!(!nothing.handle.request_send().await.expect("request"));
        let quiet = tokio::time::timeout(Duration::from_millis(50), nothing.metadata.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_sender_follows_progress_to_completion() {
        let mut h = start(true, None, 2, 4);

        h.handle.send_file("s.bin", (0..10).collect()).await.expect("offer");
        let _ = h.expect_metadata().await;
        h.send(MetadataMessage::Accepted).await;

        let mut chunks = Vec::new();
        for index in 0..3u16 {
            let channel = &mut h.transfer[usize::from(index % 2)];
            match channel.recv().await.expect("open").expect("ok") {
                ChannelMessage::Binary(data) => chunks.push(data),
                ChannelMessage::Text(_) => panic!("text on transfer channel"),
            }
        }
        assert_eq!(chunks.concat(), (0..10).collect::<Vec<u8>>());

        h.send(MetadataMessage::progress(2)).await;
        h.send(MetadataMessage::Progress {
            value: 0,
            time_elapsed: Some(0.5),
        })
        .await;

        loop {
            match h.expect_ui().await {
                UiEvent::Finished(Outcome::Sent { filename, elapsed }) => {
                    assert_eq!(filename, "s.bin");
                    assert_eq!(elapsed, Duration::from_millis(500));
                    break;
                }
                UiEvent::Finished(other) => panic!("unexpected outcome: {other:?}"),
                _ => {}
            }
        }
        assert_eq!(h.handle.state(), TransferStatus::idle());
    }

    #[tokio::test]
    async fn test_lost_transfer_channel_aborts_then_disconnect_ends_session() {
        let mut h = start(true, None, 2, 4);

        h.send(MetadataMessage::Start {
            filename: "cut.bin".to_string(),
            total_chunks: 4,
        })
        .await;
        assert!(matches!(h.expect_ui().await, UiEvent::Confirm(_)));
        assert_eq!(h.expect_metadata().await, MetadataMessage::Accepted);

        drop(h.transfer.pop());
        match h.expect_ui().await {
            UiEvent::Finished(Outcome::Aborted { filename, .. }) => assert_eq!(filename, "cut.bin"),
            other => panic!("unexpected ui event: {other:?}"),
        }
        assert_eq!(h.handle.state().state, TransferState::Idle);

        assert!(matches!(
            h.handle.send_file("later", vec![0; 4]).await,
            Err(Error::Channel { .. })
        ));

        drop(h.metadata);
        let result = tokio::time::timeout(WAIT, h.task).await.expect("session ends");
        assert!(matches!(result.expect("join"), Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_pending_offer() {
        let mut h = start(true, None, 1, 4);

        h.handle.send_file("bye.txt", vec![1]).await.expect("offer");
        let _ = h.expect_metadata().await;

        h.handle.shutdown().await;
        assert!(matches!(
            h.expect_ui().await,
            UiEvent::Finished(Outcome::Aborted { .. })
        ));
        assert!(h.task.await.expect("join").is_ok());
        assert!(matches!(
            h.handle.send_file("x", vec![]).await,
            Err(Error::Disconnected)
        ));
    }

    struct PromptGuard(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for PromptGuard {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Never answers the consent prompt.
    struct SilentUi {
        prompt_dropped: Arc<std::sync::atomic::AtomicBool>,
        events: mpsc::UnboundedSender<UiEvent>,
    }

    impl UserInterface for SilentUi {
        async fn confirm(&self, filename: &str) -> bool {
            let _guard = PromptGuard(Arc::clone(&self.prompt_dropped));
            let _ = self.events.send(UiEvent::Confirm(filename.to_string()));
            std::future::pending::<bool>().await
        }

        async fn select_file(&self) -> Option<SelectedFile> {
            None
        }

        fn show_progress(&self, _value: u64, _max: u64) {}

        fn notify(&self, _message: &str) {}

        fn deliver_artifact(&self, _data: &[u8], _filename: &str) -> Result<()> {
            Ok(())
        }

        fn finished(&self, outcome: &Outcome) {
            let _ = self.events.send(UiEvent::Finished(outcome.clone()));
        }
    }

    #[tokio::test]
    async fn test_abort_cancels_pending_consent_prompt() {
        let (local, mut remote) = memory::link(1, 16);
        let (pool, events) = ChannelPool::new(local, 1).expect("pool");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let prompt_dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ui = Arc::new(SilentUi {
            prompt_dropped: Arc::clone(&prompt_dropped),
            events: tx,
        });
        let (session, _handle) =
            Session::new(pool, events, ui, &TransferConfig::default()).expect("session");
        let task = tokio::spawn(session.run());

        remote.sort_by_key(Channel::label);
        let start = MetadataMessage::Start {
            filename: "late.txt".to_string(),
            total_chunks: 1,
        };
        remote[0]
            .send(ChannelMessage::Text(start.encode().expect("encode")))
            .await
            .expect("send start");

        let asked = tokio::time::timeout(WAIT, rx.recv()).await.expect("prompt in time");
        assert!(matches!(asked, Some(UiEvent::Confirm(name)) if name == "late.txt"));

        drop(remote);
        let result = tokio::time::timeout(WAIT, task).await.expect("session ends");
        assert!(matches!(result.expect("join"), Err(Error::Disconnected)));
        assert!(matches!(
            rx.recv().await,
            Some(UiEvent::Finished(Outcome::Aborted { .. }))
        ));

        tokio::time::timeout(WAIT, async {
            while !prompt_dropped.load(std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("prompt cancelled");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TransferState::AwaitingConsent.to_string(), "awaiting consent");
        assert_eq!(TransferStatus::idle().state, TransferState::Idle);
    }
}
