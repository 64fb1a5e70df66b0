//! Session state shared between the orchestrator and its tasks.
//!
//! `SharedState` is written only by the orchestrator's command-processing
//! task. Every other task (and the rendering layer) reads through the
//! accessors below, so transitions never race.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

/// The four session phases. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceState {
    Idle,
    Connecting,
    Listening,
    Speaking,
}

/// Why an in-flight speech phase was aborted. Passed as a transition
/// argument, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    None,
    WakeWordDetected,
    UserInterruption,
}

/// How a listening session ends. Chosen per session and sent to the
/// backend, not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ListeningMode {
    AlwaysOn,
    AutoStop,
    Manual,
}

impl Default for ListeningMode {
    fn default() -> Self {
        ListeningMode::AutoStop
    }
}

impl ListeningMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always_on" => Some(ListeningMode::AlwaysOn),
            "auto_stop" => Some(ListeningMode::AutoStop),
            "manual" => Some(ListeningMode::Manual),
            _ => None,
        }
    }
}

/// Session counters plus the device state, single-writer.
pub struct SharedState {
    device_state: RwLock<DeviceState>,
    keep_listening: AtomicBool,
    aborted: AtomicBool,
    is_tts_playing: AtomicBool,
    current_text: Mutex<String>,
    current_emotion: Mutex<String>,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            device_state: RwLock::new(DeviceState::Idle),
            keep_listening: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            is_tts_playing: AtomicBool::new(false),
            current_text: Mutex::new(String::new()),
            current_emotion: Mutex::new("neutral".to_string()),
        }
    }

    pub fn device_state(&self) -> DeviceState {
        match self.device_state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Only the orchestrator's command task calls this.
    pub(crate) fn set_device_state(&self, state: DeviceState) {
        match self.device_state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn keep_listening(&self) -> bool {
        self.keep_listening.load(Ordering::SeqCst)
    }

    pub(crate) fn set_keep_listening(&self, value: bool) {
        self.keep_listening.store(value, Ordering::SeqCst);
    }

    /// Marks an abort as in flight. Returns false when one already is, so
    /// overlapping abort triggers collapse into a single side-effect pass.
    pub(crate) fn begin_abort(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_abort(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_tts_playing(&self) -> bool {
        self.is_tts_playing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tts_playing(&self, value: bool) {
        self.is_tts_playing.store(value, Ordering::SeqCst);
    }

    pub fn current_text(&self) -> String {
        match self.current_text.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_current_text(&self, text: &str) {
        match self.current_text.lock() {
            Ok(mut guard) => *guard = text.to_string(),
            Err(poisoned) => *poisoned.into_inner() = text.to_string(),
        }
    }

    pub fn current_emotion(&self) -> String {
        match self.current_emotion.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_current_emotion(&self, emotion: &str) {
        match self.current_emotion.lock() {
            Ok(mut guard) => *guard = emotion.to_string(),
            Err(poisoned) => *poisoned.into_inner() = emotion.to_string(),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_spellings() {
        assert_eq!(DeviceState::Idle.to_string(), "idle");
        assert_eq!(DeviceState::Connecting.to_string(), "connecting");
        assert_eq!(DeviceState::Listening.to_string(), "listening");
        assert_eq!(DeviceState::Speaking.to_string(), "speaking");
        assert_eq!(AbortReason::WakeWordDetected.to_string(), "wake_word_detected");
        assert_eq!(AbortReason::UserInterruption.to_string(), "user_interruption");
        assert_eq!(AbortReason::None.to_string(), "none");
        assert_eq!(ListeningMode::AlwaysOn.to_string(), "always_on");
        assert_eq!(ListeningMode::AutoStop.to_string(), "auto_stop");
        assert_eq!(ListeningMode::Manual.to_string(), "manual");
    }

    #[test]
    fn test_listening_mode_parse() {
        assert_eq!(ListeningMode::parse("manual"), Some(ListeningMode::Manual));
        assert_eq!(ListeningMode::parse("auto_stop"), Some(ListeningMode::AutoStop));
        assert_eq!(ListeningMode::parse("bogus"), None);
    }

    #[test]
    fn test_abort_flag_collapses_overlapping_aborts() {
        let state = SharedState::new();
        assert!(state.begin_abort());
        assert!(!state.begin_abort());
        state.clear_abort();
        assert!(state.begin_abort());
    }

    #[test]
    fn test_defaults() {
        let state = SharedState::new();
        assert_eq!(state.device_state(), DeviceState::Idle);
        assert!(!state.keep_listening());
        assert!(!state.is_tts_playing());
        assert_eq!(state.current_emotion(), "neutral");
    }
}
