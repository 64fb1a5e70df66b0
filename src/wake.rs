//! Wake-word gating.
//!
//! The gate wraps a pluggable detector and owns the pause/enable flags. The
//! orchestrator pauses the gate while the backend channel is actively
//! listening and resumes it for idle/speaking phases, so detection can
//! re-trigger an abort during playback. A detector that keeps failing is
//! disabled for the rest of the session instead of being restarted forever.

use crate::audio::{AudioPipeline, INPUT_FRAME_SAMPLES};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    Detected { phrase: String },
    Failed { error: String },
}

/// Pause/enable flags shared with the detector loop.
#[derive(Clone)]
pub struct GateControl {
    paused: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
}

impl GateControl {
    fn new(enabled: bool) -> Self {
        GateControl {
            paused: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// The acoustic side of wake-word detection. Implementations spawn their own
/// read loop over the pipeline's wake tap and report through `events`.
#[async_trait]
pub trait WakeWordDetector: Send + Sync {
    /// Returns false when the detector cannot start (missing model, device).
    async fn start(
        &self,
        audio: Arc<AudioPipeline>,
        control: GateControl,
        events: mpsc::Sender<WakeEvent>,
    ) -> Result<bool>;

    async fn stop(&self);
}

pub struct WakeWordGate {
    detector: Arc<dyn WakeWordDetector>,
    control: GateControl,
    running: AtomicBool,
}

impl WakeWordGate {
    pub fn new(detector: Arc<dyn WakeWordDetector>, enabled: bool) -> Arc<Self> {
        Arc::new(WakeWordGate {
            detector,
            control: GateControl::new(enabled),
            running: AtomicBool::new(false),
        })
    }

    /// No-op when disabled or already running.
    pub async fn start(
        &self,
        audio: Arc<AudioPipeline>,
        events: mpsc::Sender<WakeEvent>,
    ) -> Result<bool> {
        if !self.control.is_enabled() {
            log::info!("wake word detection disabled, not starting");
            return Ok(false);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        match self.detector.start(audio, self.control.clone(), events).await {
            Ok(true) => {
                log::info!("wake word detector started");
                Ok(true)
            }
            Ok(false) => {
                self.running.store(false, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Idempotent. Pausing an already-paused gate is a no-op.
    pub fn pause(&self) {
        if !self.control.paused.swap(true, Ordering::SeqCst) {
            log::debug!("wake word detection paused");
        }
    }

    /// Idempotent. Resuming a non-paused or disabled gate is a no-op.
    pub fn resume(&self) {
        if !self.control.is_enabled() {
            return;
        }
        if self.control.paused.swap(false, Ordering::SeqCst) {
            log::debug!("wake word detection resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.detector.stop().await;
            log::info!("wake word detector stopped");
        }
    }

    /// Permanent for the session: stops the detector and refuses restarts.
    pub async fn disable(&self) {
        self.control.enabled.store(false, Ordering::SeqCst);
        self.stop().await;
        log::warn!("wake word detection disabled for the rest of the session");
    }

    pub async fn restart(
        &self,
        audio: Arc<AudioPipeline>,
        events: mpsc::Sender<WakeEvent>,
    ) -> Result<bool> {
        self.stop().await;
        self.start(audio, events).await
    }
}

/// Reference detector: RMS energy over consecutive frames. Stands in for an
/// acoustic model behind the same trait.
#[derive(Debug, Clone)]
pub struct EnergyDetectorConfig {
    /// Normalized RMS (0.0..=1.0) a frame must reach.
    pub threshold: f32,
    /// Consecutive loud frames required to trigger.
    pub trigger_frames: usize,
    /// Minimum spacing between two detections.
    pub cooldown: Duration,
    /// Phrase reported with each detection.
    pub phrase: String,
    /// Consecutive malformed frames tolerated before the detector gives up.
    pub max_read_errors: usize,
}

impl Default for EnergyDetectorConfig {
    fn default() -> Self {
        EnergyDetectorConfig {
            threshold: 0.12,
            trigger_frames: 4,
            cooldown: Duration::from_secs(3),
            phrase: "hey vox".to_string(),
            max_read_errors: 5,
        }
    }
}

pub struct EnergyDetector {
    config: EnergyDetectorConfig,
    token: Mutex<Option<CancellationToken>>,
}

impl EnergyDetector {
    pub fn new(config: EnergyDetectorConfig) -> Arc<Self> {
        Arc::new(EnergyDetector {
            config,
            token: Mutex::new(None),
        })
    }
}

fn normalized_rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_squares / frame.len() as f64).sqrt() / i16::MAX as f64) as f32
}

#[async_trait]
impl WakeWordDetector for EnergyDetector {
    async fn start(
        &self,
        audio: Arc<AudioPipeline>,
        control: GateControl,
        events: mpsc::Sender<WakeEvent>,
    ) -> Result<bool> {
        let token = CancellationToken::new();
        {
            let mut slot = match self.token.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(old) = slot.replace(token.clone()) {
                old.cancel();
            }
        }

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut streak = 0usize;
            let mut read_errors = 0usize;
            let mut last_trigger: Option<Instant> = None;

            loop {
                if token.is_cancelled() {
                    break;
                }
                if control.is_paused() || !control.is_enabled() {
                    streak = 0;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                let Some(frame) = audio.read_detection_frame() else {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue;
                };
                if frame.len() != INPUT_FRAME_SAMPLES {
                    read_errors += 1;
                    log::debug!(
                        "detector read error {read_errors}/{}: frame of {} samples",
                        config.max_read_errors,
                        frame.len()
                    );
                    if read_errors >= config.max_read_errors {
                        let _ = events
                            .send(WakeEvent::Failed {
                                error: format!(
                                    "{read_errors} consecutive malformed capture frames"
                                ),
                            })
                            .await;
                        break;
                    }
                    continue;
                }
                read_errors = 0;

                if normalized_rms(&frame) >= config.threshold {
                    streak += 1;
                } else {
                    streak = 0;
                }
                if streak >= config.trigger_frames {
                    streak = 0;
                    let in_cooldown = last_trigger
                        .map(|t| t.elapsed() < config.cooldown)
                        .unwrap_or(false);
                    if in_cooldown {
                        continue;
                    }
                    last_trigger = Some(Instant::now());
                    log::info!("wake word detected: '{}'", config.phrase);
                    if events
                        .send(WakeEvent::Detected {
                            phrase: config.phrase.clone(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });
        Ok(true)
    }

    async fn stop(&self) {
        let token = {
            let mut slot = match self.token.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PcmCodec;

    fn loud_frame() -> Vec<i16> {
        vec![20_000; INPUT_FRAME_SAMPLES]
    }

    fn quiet_frame() -> Vec<i16> {
        vec![50; INPUT_FRAME_SAMPLES]
    }

    fn test_detector(max_read_errors: usize) -> Arc<EnergyDetector> {
        EnergyDetector::new(EnergyDetectorConfig {
            threshold: 0.3,
            trigger_frames: 3,
            cooldown: Duration::from_secs(3),
            phrase: "hey vox".to_string(),
            max_read_errors,
        })
    }

    #[test]
    fn test_normalized_rms() {
        assert_eq!(normalized_rms(&[]), 0.0);
        assert!(normalized_rms(&quiet_frame()) < 0.01);
        let loud = normalized_rms(&loud_frame());
        assert!(loud > 0.5 && loud < 0.7);
    }

    #[test]
    fn test_gate_pause_resume_idempotent() {
        let gate = WakeWordGate::new(test_detector(5), true);
        assert!(!gate.is_paused());
        gate.pause();
        gate.pause();
        assert!(gate.is_paused());
        gate.resume();
        gate.resume();
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn test_disabled_gate_refuses_start() {
        let gate = WakeWordGate::new(test_detector(5), false);
        let audio = AudioPipeline::new(Box::new(PcmCodec));
        let (tx, _rx) = mpsc::channel(8);
        assert!(!gate.start(audio, tx).await.unwrap());
        assert!(!gate.is_running());
    }

    #[tokio::test]
    async fn test_disable_is_permanent() {
        let gate = WakeWordGate::new(test_detector(5), true);
        let audio = AudioPipeline::new(Box::new(PcmCodec));
        let (tx, _rx) = mpsc::channel(8);
        assert!(gate.start(audio.clone(), tx.clone()).await.unwrap());
        gate.disable().await;
        assert!(!gate.is_enabled());
        assert!(!gate.start(audio, tx).await.unwrap());
    }

    #[tokio::test]
    async fn test_detects_sustained_loud_signal_once_per_cooldown() {
        let detector = test_detector(5);
        let gate = WakeWordGate::new(detector, true);
        let audio = AudioPipeline::new(Box::new(PcmCodec));
        let (tx, mut rx) = mpsc::channel(8);
        assert!(gate.start(audio.clone(), tx).await.unwrap());

        for _ in 0..10 {
            audio.feed_input(&loud_frame());
        }
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("detection within bound")
            .expect("channel open");
        assert_eq!(
            event,
            WakeEvent::Detected {
                phrase: "hey vox".to_string()
            }
        );

        // More loud frames inside the cooldown window: no second event.
        for _ in 0..10 {
            audio.feed_input(&loud_frame());
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );
        gate.stop().await;
    }

    #[tokio::test]
    async fn test_paused_gate_ignores_loud_frames() {
        let gate = WakeWordGate::new(test_detector(5), true);
        let audio = AudioPipeline::new(Box::new(PcmCodec));
        let (tx, mut rx) = mpsc::channel(8);
        gate.start(audio.clone(), tx).await.unwrap();
        gate.pause();

        for _ in 0..10 {
            audio.feed_input(&loud_frame());
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );
        gate.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_read_errors_emit_failed() {
        let gate = WakeWordGate::new(test_detector(3), true);
        let audio = AudioPipeline::new(Box::new(PcmCodec));
        let (tx, mut rx) = mpsc::channel(8);
        gate.start(audio.clone(), tx).await.unwrap();

        for _ in 0..4 {
            audio.feed_input(&[1i16; 16]);
        }
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("failure within bound")
            .expect("channel open");
        assert!(matches!(event, WakeEvent::Failed { .. }));
        gate.stop().await;
    }
}
