//! Common test utilities for `FilePortal` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fileportal_core::channel::Channel;
use fileportal_core::config::TransferConfig;
use fileportal_core::pool::ChannelPool;
use fileportal_core::session::{Session, SessionHandle};
use fileportal_core::ui::{Outcome, SelectedFile, UserInterface};
use fileportal_core::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a test waits for any single event.
pub const WAIT: Duration = Duration::from_secs(10);

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Something the session told the UI.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Confirm(String),
    Progress(u64, u64),
    Notify(String),
    Delivered(String, Vec<u8>),
    Finished(Outcome),
}

/// UI that answers consent with a fixed choice and records every call.
pub struct RecordingUi {
    accept: bool,
    selection: Mutex<Option<SelectedFile>>,
    events: mpsc::UnboundedSender<UiEvent>,
}

impl RecordingUi {
    pub fn new(accept: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ui = Arc::new(Self {
            accept,
            selection: Mutex::new(None),
            events: tx,
        });
        (ui, rx)
    }

    pub fn select(&self, file: SelectedFile) {
        *self.selection.lock().expect("selection lock") = Some(file);
    }

    fn record(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }
}

impl UserInterface for RecordingUi {
    async fn confirm(&self, filename: &str) -> bool {
        self.record(UiEvent::Confirm(filename.to_string()));
        self.accept
    }

    async fn select_file(&self) -> Option<SelectedFile> {
        self.selection.lock().expect("selection lock").take()
    }

    fn show_progress(&self, value: u64, max: u64) {
        self.record(UiEvent::Progress(value, max));
    }

    fn notify(&self, message: &str) {
        self.record(UiEvent::Notify(message.to_string()));
    }

    fn deliver_artifact(&self, data: &[u8], filename: &str) -> Result<()> {
        self.record(UiEvent::Delivered(filename.to_string(), data.to_vec()));
        Ok(())
    }

    fn finished(&self, outcome: &Outcome) {
        self.record(UiEvent::Finished(outcome.clone()));
    }
}

/// A running session plus everything a test needs to observe it.
pub struct Peer {
    pub handle: SessionHandle,
    pub task: JoinHandle<Result<()>>,
    pub ui: Arc<RecordingUi>,
    pub events: mpsc::UnboundedReceiver<UiEvent>,
}

impl Peer {
    /// Start a session over `channels`.
    pub fn spawn(channels: Vec<Channel>, transfer_count: u16, chunk_size: usize, accept: bool) -> Self {
        let (pool, pool_events) = ChannelPool::new(channels, transfer_count).expect("pool");
        let (ui, events) = RecordingUi::new(accept);
        let config = TransferConfig {
            chunk_size,
            ..TransferConfig::default()
        };
        let (session, handle) =
            Session::new(pool, pool_events, Arc::clone(&ui), &config).expect("session");

        Self {
            handle,
            task: tokio::spawn(session.run()),
            ui,
            events,
        }
    }

    /// Wait for the next transfer outcome, skipping other UI events.
    pub async fn outcome(&mut self) -> Outcome {
        self.wait_for(|event| match event {
            UiEvent::Finished(outcome) => Some(outcome.clone()),
            _ => None,
        })
        .await
    }

    /// Wait for the next delivered artifact.
    pub async fn delivered(&mut self) -> (String, Vec<u8>) {
        self.wait_for(|event| match event {
            UiEvent::Delivered(name, data) => Some((name.clone(), data.clone())),
            _ => None,
        })
        .await
    }

    /// Wait for the first UI event `pick` maps to `Some`.
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(&UiEvent) -> Option<T>) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("ui events open");
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
        })
        .await
        .expect("ui event in time")
    }

    /// Drain everything recorded so far.
    pub fn recorded(&mut self) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
