//! Uniform surface over the backend transport.
//!
//! The orchestrator depends only on [`TransportChannel`]; wire formats live
//! in the implementations. Backend-initiated traffic arrives as a closed
//! [`TransportEvent`] enum over an mpsc channel handed to the transport at
//! construction, so the set of things a transport can signal is statically
//! enumerable.

use crate::error::Result;
use crate::state::{AbortReason, ListeningMode};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

pub mod loopback;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    NetworkError(String),
    IncomingAudio(Vec<u8>),
    IncomingJson(Value),
    AudioChannelOpened,
    AudioChannelClosed,
}

pub type TransportEventSender = mpsc::Sender<TransportEvent>;
pub type TransportEventReceiver = mpsc::Receiver<TransportEvent>;

/// Capacity of the transport event channel. Incoming audio dominates; at
/// 60 ms a frame this is multiple seconds of headroom.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Establish the control connection. False means a clean refusal
    /// (retryable), errors mean the attempt itself broke.
    async fn connect(&self) -> Result<bool>;

    /// Open the audio channel on an established connection.
    async fn open_audio_channel(&self) -> Result<bool>;

    async fn close_audio_channel(&self) -> Result<()>;

    fn is_audio_channel_opened(&self) -> bool;

    async fn send_audio(&self, frame: Vec<u8>) -> Result<()>;

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<()>;

    async fn send_stop_listening(&self) -> Result<()>;

    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<()>;

    /// Also carries typed text from the UI's text-entry path.
    async fn send_wake_word_detected(&self, text: &str) -> Result<()>;

    async fn send_iot_descriptors(&self, descriptors: &str) -> Result<()>;

    async fn send_iot_states(&self, states: &str) -> Result<()>;

    async fn send_mcp_message(&self, payload: Value) -> Result<()>;
}
