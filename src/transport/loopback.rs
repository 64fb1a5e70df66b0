//! In-process echo backend.
//!
//! Stands in for a real server: accepts the audio channel, counts uploaded
//! frames, and answers every finished listening turn with an stt transcript,
//! a short synthesized tone wrapped in tts start/stop, paced at real time.
//! Used by the demo binary and the integration tests.

use super::{TransportChannel, TransportEvent, TransportEventSender};
use crate::audio::OUTPUT_FRAME_SAMPLES;
use crate::error::Result;
use crate::state::{AbortReason, ListeningMode};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REPLY_FRAMES: usize = 8;
const FRAME_INTERVAL: Duration = Duration::from_millis(60);

pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

struct Inner {
    events: TransportEventSender,
    opened: AtomicBool,
    uploaded: AtomicUsize,
    speaking: std::sync::Mutex<CancellationToken>,
}

impl LoopbackTransport {
    pub fn new(events: TransportEventSender) -> Self {
        LoopbackTransport {
            inner: Arc::new(Inner {
                events,
                opened: AtomicBool::new(false),
                uploaded: AtomicUsize::new(0),
                speaking: std::sync::Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Frames uploaded since the channel opened.
    pub fn uploaded_frames(&self) -> usize {
        self.inner.uploaded.load(Ordering::SeqCst)
    }
}

fn tone_frame(index: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(OUTPUT_FRAME_SAMPLES * 2);
    for n in 0..OUTPUT_FRAME_SAMPLES {
        let t = (index * OUTPUT_FRAME_SAMPLES + n) as f32 / 24_000.0;
        let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

impl Inner {
    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("loopback event receiver gone");
        }
    }

    /// Re-arm the abort token for a fresh reply turn.
    fn arm_reply(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        match self.speaking.lock() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        fresh
    }

    fn abort_reply(&self) {
        match self.speaking.lock() {
            Ok(guard) => guard.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    async fn speak_reply(self: Arc<Self>, transcript: String) {
        let guard = self.arm_reply();
        self.emit(TransportEvent::IncomingJson(json!({
            "type": "stt",
            "text": transcript,
        })))
        .await;
        self.emit(TransportEvent::IncomingJson(json!({
            "type": "tts",
            "state": "start",
        })))
        .await;
        self.emit(TransportEvent::IncomingJson(json!({
            "type": "tts",
            "state": "sentence_start",
            "text": "Heard you loud and clear.",
        })))
        .await;

        for index in 0..REPLY_FRAMES {
            if guard.is_cancelled() {
                log::debug!("loopback reply aborted at frame {index}");
                break;
            }
            self.emit(TransportEvent::IncomingAudio(tone_frame(index))).await;
            tokio::time::sleep(FRAME_INTERVAL).await;
        }

        self.emit(TransportEvent::IncomingJson(json!({
            "type": "tts",
            "state": "stop",
        })))
        .await;
    }
}

#[async_trait]
impl TransportChannel for LoopbackTransport {
    async fn connect(&self) -> Result<bool> {
        Ok(true)
    }

    async fn open_audio_channel(&self) -> Result<bool> {
        if !self.inner.opened.swap(true, Ordering::SeqCst) {
            self.inner.uploaded.store(0, Ordering::SeqCst);
            self.inner.emit(TransportEvent::AudioChannelOpened).await;
        }
        Ok(true)
    }

    async fn close_audio_channel(&self) -> Result<()> {
        if self.inner.opened.swap(false, Ordering::SeqCst) {
            self.inner.emit(TransportEvent::AudioChannelClosed).await;
        }
        Ok(())
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.inner.opened.load(Ordering::SeqCst)
    }

    async fn send_audio(&self, _frame: Vec<u8>) -> Result<()> {
        self.inner.uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<()> {
        log::debug!("loopback: start listening ({mode})");
        Ok(())
    }

    async fn send_stop_listening(&self) -> Result<()> {
        let uploaded = self.inner.uploaded.swap(0, Ordering::SeqCst);
        let transcript = format!("(echo of {uploaded} uploaded frames)");
        tokio::spawn(Arc::clone(&self.inner).speak_reply(transcript));
        Ok(())
    }

    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<()> {
        log::debug!("loopback: abort speaking ({reason})");
        self.inner.abort_reply();
        Ok(())
    }

    async fn send_wake_word_detected(&self, text: &str) -> Result<()> {
        let transcript = format!("(echo of '{text}')");
        tokio::spawn(Arc::clone(&self.inner).speak_reply(transcript));
        Ok(())
    }

    async fn send_iot_descriptors(&self, descriptors: &str) -> Result<()> {
        log::debug!("loopback: thing descriptors: {descriptors}");
        Ok(())
    }

    async fn send_iot_states(&self, states: &str) -> Result<()> {
        log::debug!("loopback: thing states: {states}");
        Ok(())
    }

    async fn send_mcp_message(&self, payload: Value) -> Result<()> {
        log::debug!("loopback: mcp message: {payload}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::event_channel;

    #[tokio::test]
    async fn test_open_close_emit_events() {
        let (tx, mut rx) = event_channel();
        let transport = LoopbackTransport::new(tx);
        assert!(!transport.is_audio_channel_opened());
        assert!(transport.open_audio_channel().await.unwrap());
        assert!(transport.is_audio_channel_opened());
        assert_eq!(rx.recv().await, Some(TransportEvent::AudioChannelOpened));
        // Re-opening an open channel emits nothing.
        assert!(transport.open_audio_channel().await.unwrap());
        transport.close_audio_channel().await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::AudioChannelClosed));
    }

    #[tokio::test]
    async fn test_stop_listening_produces_full_reply_turn() {
        let (tx, mut rx) = event_channel();
        let transport = LoopbackTransport::new(tx);
        transport.open_audio_channel().await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::AudioChannelOpened));

        transport.send_audio(vec![0u8; 640]).await.unwrap();
        transport.send_stop_listening().await.unwrap();

        let mut audio_frames = 0;
        let mut saw_stt = false;
        let mut saw_start = false;
        let mut saw_stop = false;
        while !saw_stop {
            let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("reply within bound")
                .expect("channel open");
            match event {
                TransportEvent::IncomingAudio(frame) => {
                    assert_eq!(frame.len(), OUTPUT_FRAME_SAMPLES * 2);
                    audio_frames += 1;
                }
                TransportEvent::IncomingJson(value) => {
                    match value["type"].as_str() {
                        Some("stt") => saw_stt = true,
                        Some("tts") => match value["state"].as_str() {
                            Some("start") => saw_start = true,
                            Some("stop") => saw_stop = true,
                            _ => {}
                        },
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        assert!(saw_stt && saw_start);
        assert_eq!(audio_frames, REPLY_FRAMES);
    }
}
