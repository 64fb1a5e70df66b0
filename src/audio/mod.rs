//! Bridges real-time device callbacks and the cooperative-task world.
//!
//! Four bounded queues, each with one producer role and one consumer role:
//!
//! - capture: device callback -> forwarder task (`read_audio`)
//! - wake tap: device callback -> wake-word detector (`read_detection_frame`)
//! - decode: transport (`write_audio`) -> output drainer (`pop_decoded`)
//! - playback ring: output drainer (`queue_playback`) -> device callback
//!
//! Backpressure policy is evict-oldest everywhere: stale audio is worse than
//! a small gap. Device callbacks never block and never panic past their
//! boundary.

pub mod device;

use crate::error::{Result, VoxError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Capture side: 16 kHz mono, 20 ms frames.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const INPUT_FRAME_SAMPLES: usize = 320;

/// Playback side: 24 kHz mono, 60 ms frames.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const OUTPUT_FRAME_SAMPLES: usize = 1_440;

const CAPTURE_QUEUE_FRAMES: usize = 100;
const WAKE_QUEUE_FRAMES: usize = 100;
const DECODE_QUEUE_FRAMES: usize = 500;
/// About two seconds of playback audio.
const PLAYBACK_RING_SAMPLES: usize = OUTPUT_SAMPLE_RATE as usize * 2;
/// Drainer stops topping up the ring above this level.
pub(crate) const PLAYBACK_HIGH_WATER: usize = OUTPUT_SAMPLE_RATE as usize / 2;

const COMPLETE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const COMPLETE_TAIL_GRACE: Duration = Duration::from_millis(300);

/// Seam for the encode/decode step. DSP correctness lives behind this trait;
/// the pipeline only validates frame sizes.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, pcm: &[i16]) -> Result<Vec<u8>>;
    fn decode(&self, frame: &[u8]) -> Result<Vec<i16>>;
}

/// Little-endian PCM passthrough.
pub struct PcmCodec;

impl FrameCodec for PcmCodec {
    fn encode(&self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, frame: &[u8]) -> Result<Vec<i16>> {
        if frame.len() % 2 != 0 {
            return Err(VoxError::Audio(format!(
                "frame of {} bytes is not whole 16-bit samples",
                frame.len()
            )));
        }
        Ok(frame
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Queue state shared with the device callbacks.
pub(crate) struct PipelineBuffers {
    capture: Mutex<VecDeque<Vec<i16>>>,
    wake: Mutex<VecDeque<Vec<i16>>>,
    decoded: Mutex<VecDeque<Vec<i16>>>,
    playback: Mutex<VecDeque<i16>>,
    input_paused: AtomicBool,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PipelineBuffers {
    fn new() -> Self {
        PipelineBuffers {
            capture: Mutex::new(VecDeque::with_capacity(CAPTURE_QUEUE_FRAMES)),
            wake: Mutex::new(VecDeque::with_capacity(WAKE_QUEUE_FRAMES)),
            decoded: Mutex::new(VecDeque::with_capacity(DECODE_QUEUE_FRAMES)),
            playback: Mutex::new(VecDeque::with_capacity(PLAYBACK_RING_SAMPLES)),
            input_paused: AtomicBool::new(false),
        }
    }

    /// Called from the input device callback. Always feeds the wake tap so
    /// detection keeps hearing while input is paused; the capture queue is
    /// skipped while paused.
    pub(crate) fn push_capture(&self, frame: Vec<i16>) {
        {
            let mut wake = lock_or_recover(&self.wake);
            if wake.len() >= WAKE_QUEUE_FRAMES {
                wake.pop_front();
            }
            wake.push_back(frame.clone());
        }
        if self.input_paused.load(Ordering::SeqCst) {
            return;
        }
        let mut capture = lock_or_recover(&self.capture);
        if capture.len() >= CAPTURE_QUEUE_FRAMES {
            capture.pop_front();
            log::debug!("capture queue full, dropped oldest frame");
        }
        capture.push_back(frame);
    }

    /// Called from the output device callback. Fills `out` from the playback
    /// ring, zero-padding when the ring runs dry.
    pub(crate) fn fill_playback(&self, out: &mut [i16]) {
        let mut ring = lock_or_recover(&self.playback);
        for slot in out.iter_mut() {
            *slot = ring.pop_front().unwrap_or(0);
        }
    }
}

/// The audio pipeline. Owns the queues; the device streams live on a worker
/// thread attached with [`AudioPipeline::initialize`].
pub struct AudioPipeline {
    codec: Box<dyn FrameCodec>,
    buffers: Arc<PipelineBuffers>,
    worker: Mutex<Option<device::DeviceWorker>>,
    closing: AtomicBool,
}

impl AudioPipeline {
    pub fn new(codec: Box<dyn FrameCodec>) -> Arc<Self> {
        Arc::new(AudioPipeline {
            codec,
            buffers: Arc::new(PipelineBuffers::new()),
            worker: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    /// Attach the real device streams. Tests drive the queues directly via
    /// [`AudioPipeline::feed_input`] and never call this.
    pub fn initialize(&self) -> Result<()> {
        let mut worker = lock_or_recover(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        *worker = Some(device::DeviceWorker::start(Arc::clone(&self.buffers))?);
        log::info!("audio device streams started");
        Ok(())
    }

    /// Route raw input samples exactly as the device callback does. Public
    /// so in-process audio sources (and tests) can stand in for a device.
    pub fn feed_input(&self, frame: &[i16]) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        self.buffers.push_capture(frame.to_vec());
    }

    /// Non-blocking: one encoded capture frame, or None when the queue is
    /// empty. Frames of unexpected size are dropped with a warning rather
    /// than corrupting the encoded stream.
    pub fn read_audio(&self) -> Option<Vec<u8>> {
        let frame = lock_or_recover(&self.buffers.capture).pop_front()?;
        if frame.len() != INPUT_FRAME_SAMPLES {
            log::warn!(
                "dropping capture frame of {} samples (expected {})",
                frame.len(),
                INPUT_FRAME_SAMPLES
            );
            return None;
        }
        match self.codec.encode(&frame) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                log::warn!("encode failed, frame dropped: {e}");
                None
            }
        }
    }

    /// One raw frame from the wake tap, for the detector loop.
    pub fn read_detection_frame(&self) -> Option<Vec<i16>> {
        lock_or_recover(&self.buffers.wake).pop_front()
    }

    /// Non-blocking enqueue of one encoded frame onto the decode queue. On a
    /// full queue the oldest frame is evicted first, so the queue length
    /// never grows past its bound and recent audio wins.
    pub fn write_audio(&self, frame: &[u8]) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let decoded = match self.codec.decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("decode failed, frame dropped: {e}");
                return;
            }
        };
        if decoded.len() != OUTPUT_FRAME_SAMPLES {
            log::warn!(
                "dropping decoded frame of {} samples (expected {})",
                decoded.len(),
                OUTPUT_FRAME_SAMPLES
            );
            return;
        }
        let mut queue = lock_or_recover(&self.buffers.decoded);
        if queue.len() >= DECODE_QUEUE_FRAMES {
            queue.pop_front();
            log::debug!("decode queue full, dropped oldest frame");
        }
        queue.push_back(decoded);
    }

    /// One decoded frame for the output drainer.
    pub fn pop_decoded(&self) -> Option<Vec<i16>> {
        lock_or_recover(&self.buffers.decoded).pop_front()
    }

    /// Append a decoded frame to the playback ring, evicting the oldest
    /// samples when the ring is full.
    pub fn queue_playback(&self, frame: &[i16]) {
        let mut ring = lock_or_recover(&self.buffers.playback);
        let overflow = (ring.len() + frame.len()).saturating_sub(PLAYBACK_RING_SAMPLES);
        if overflow > 0 {
            let drop_count = overflow.min(ring.len());
            ring.drain(..drop_count);
            log::debug!("playback ring full, dropped {overflow} samples");
        }
        ring.extend(frame.iter().copied());
    }

    pub fn playback_backlog(&self) -> usize {
        lock_or_recover(&self.buffers.playback).len()
    }

    pub fn capture_len(&self) -> usize {
        lock_or_recover(&self.buffers.capture).len()
    }

    pub fn decode_len(&self) -> usize {
        lock_or_recover(&self.buffers.decoded).len()
    }

    pub fn has_pending_playback(&self) -> bool {
        self.decode_len() > 0 || self.playback_backlog() > 0
    }

    /// Drain every queue while holding all queue locks, so no frame slips
    /// between phases mid-clear. Returns how many frames were dropped.
    pub fn clear_audio_queue(&self) -> usize {
        let mut capture = lock_or_recover(&self.buffers.capture);
        let mut wake = lock_or_recover(&self.buffers.wake);
        let mut decoded = lock_or_recover(&self.buffers.decoded);
        let mut playback = lock_or_recover(&self.buffers.playback);

        let dropped = capture.len() + wake.len() + decoded.len()
            + if playback.is_empty() { 0 } else { 1 };
        capture.clear();
        wake.clear();
        decoded.clear();
        playback.clear();
        if dropped > 0 {
            log::debug!("cleared audio queues, dropped {dropped} frames");
        }
        dropped
    }

    /// Drop buffered capture frames only; playback and the wake tap are left
    /// alone. Used when entering the speaking phase so synthesized speech is
    /// not re-captured as user audio.
    pub fn clear_capture(&self) -> usize {
        let mut capture = lock_or_recover(&self.buffers.capture);
        let dropped = capture.len();
        capture.clear();
        dropped
    }

    /// Pause buffering of capture frames. The device stream keeps running
    /// and the wake tap keeps filling, so detection is unaffected.
    pub fn pause_input(&self) {
        self.buffers.input_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_input(&self) {
        self.buffers.input_paused.store(false, Ordering::SeqCst);
    }

    pub fn is_input_paused(&self) -> bool {
        self.buffers.input_paused.load(Ordering::SeqCst)
    }

    /// Tear down and recreate one device stream. Recovery path for when
    /// clearing buffers alone does not restore a clean state.
    pub fn reinitialize_stream(&self, is_input: bool) -> Result<()> {
        let worker = lock_or_recover(&self.worker);
        match worker.as_ref() {
            Some(worker) => worker.reinitialize(is_input),
            None => Ok(()),
        }
    }

    /// Poll until the decode queue and playback ring are both empty, then a
    /// short tail grace so the device can flush. Bounded by `timeout`.
    pub async fn wait_for_audio_complete(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.has_pending_playback() {
            if tokio::time::Instant::now() >= deadline {
                log::warn!(
                    "playback not complete after {timeout:?} ({} frames, {} samples left)",
                    self.decode_len(),
                    self.playback_backlog()
                );
                return;
            }
            tokio::time::sleep(COMPLETE_POLL_INTERVAL).await;
        }
        tokio::time::sleep(COMPLETE_TAIL_GRACE).await;
    }

    /// Idempotent: stops the device worker and drains every queue.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = lock_or_recover(&self.worker).take() {
            drop(worker);
        }
        self.clear_audio_queue();
        log::info!("audio pipeline closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Arc<AudioPipeline> {
        AudioPipeline::new(Box::new(PcmCodec))
    }

    fn input_frame(value: i16) -> Vec<i16> {
        vec![value; INPUT_FRAME_SAMPLES]
    }

    fn encoded_output_frame(value: i16) -> Vec<u8> {
        PcmCodec.encode(&vec![value; OUTPUT_FRAME_SAMPLES]).unwrap()
    }

    #[test]
    fn test_read_audio_round_trips_capture_frame() {
        let pipeline = pipeline();
        pipeline.feed_input(&input_frame(7));
        let encoded = pipeline.read_audio().unwrap();
        assert_eq!(encoded.len(), INPUT_FRAME_SAMPLES * 2);
        assert!(pipeline.read_audio().is_none());
    }

    #[test]
    fn test_read_audio_drops_odd_sized_frames() {
        let pipeline = pipeline();
        pipeline.feed_input(&vec![1i16; 17]);
        assert!(pipeline.read_audio().is_none());
        assert_eq!(pipeline.capture_len(), 0);
    }

    #[test]
    fn test_write_audio_evicts_oldest_when_full() {
        let pipeline = pipeline();
        for i in 0..DECODE_QUEUE_FRAMES {
            pipeline.write_audio(&encoded_output_frame(i as i16));
        }
        assert_eq!(pipeline.decode_len(), DECODE_QUEUE_FRAMES);

        pipeline.write_audio(&encoded_output_frame(-1));
        // Length unchanged: an old frame was evicted, the new one is present.
        assert_eq!(pipeline.decode_len(), DECODE_QUEUE_FRAMES);
        let first = pipeline.pop_decoded().unwrap();
        assert_eq!(first[0], 1);
        let mut last = first;
        while let Some(frame) = pipeline.pop_decoded() {
            last = frame;
        }
        assert_eq!(last[0], -1);
    }

    #[test]
    fn test_write_audio_rejects_wrong_length() {
        let pipeline = pipeline();
        pipeline.write_audio(&[0u8; 10]);
        assert_eq!(pipeline.decode_len(), 0);
        // Odd byte count cannot decode at all.
        pipeline.write_audio(&[0u8; 11]);
        assert_eq!(pipeline.decode_len(), 0);
    }

    #[test]
    fn test_clear_audio_queue_total_drain() {
        let pipeline = pipeline();
        for i in 0..25 {
            pipeline.feed_input(&input_frame(i));
            pipeline.write_audio(&encoded_output_frame(i));
        }
        pipeline.queue_playback(&[5i16; 480]);
        assert!(pipeline.has_pending_playback());

        pipeline.clear_audio_queue();
        assert_eq!(pipeline.capture_len(), 0);
        assert_eq!(pipeline.decode_len(), 0);
        assert_eq!(pipeline.playback_backlog(), 0);
        assert!(pipeline.read_detection_frame().is_none());
        // Idempotent.
        assert_eq!(pipeline.clear_audio_queue(), 0);
    }

    #[test]
    fn test_pause_skips_capture_but_not_wake_tap() {
        let pipeline = pipeline();
        pipeline.pause_input();
        pipeline.feed_input(&input_frame(3));
        assert_eq!(pipeline.capture_len(), 0);
        assert!(pipeline.read_detection_frame().is_some());

        pipeline.resume_input();
        pipeline.feed_input(&input_frame(4));
        assert_eq!(pipeline.capture_len(), 1);
    }

    #[test]
    fn test_clear_capture_leaves_playback() {
        let pipeline = pipeline();
        pipeline.feed_input(&input_frame(1));
        pipeline.write_audio(&encoded_output_frame(9));
        assert_eq!(pipeline.clear_capture(), 1);
        assert_eq!(pipeline.capture_len(), 0);
        assert_eq!(pipeline.decode_len(), 1);
        assert!(!pipeline.is_input_paused());
    }

    #[test]
    fn test_capture_queue_bounded() {
        let pipeline = pipeline();
        for i in 0..(CAPTURE_QUEUE_FRAMES + 20) {
            pipeline.feed_input(&input_frame(i as i16));
        }
        assert_eq!(pipeline.capture_len(), CAPTURE_QUEUE_FRAMES);
        // Oldest frames were the ones evicted.
        let frame = lock_or_recover(&pipeline.buffers.capture).pop_front().unwrap();
        assert_eq!(frame[0], 20);
    }

    #[test]
    fn test_playback_ring_bounded() {
        let pipeline = pipeline();
        pipeline.queue_playback(&vec![1i16; PLAYBACK_RING_SAMPLES]);
        pipeline.queue_playback(&vec![2i16; 100]);
        assert_eq!(pipeline.playback_backlog(), PLAYBACK_RING_SAMPLES);
    }

    #[test]
    fn test_fill_playback_zero_pads() {
        let pipeline = pipeline();
        pipeline.queue_playback(&[7i16; 4]);
        let mut out = [99i16; 8];
        pipeline.buffers.fill_playback(&mut out);
        assert_eq!(&out[..4], &[7, 7, 7, 7]);
        assert_eq!(&out[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_close_idempotent() {
        let pipeline = pipeline();
        pipeline.feed_input(&input_frame(1));
        pipeline.close();
        pipeline.close();
        assert_eq!(pipeline.capture_len(), 0);
        // Frames fed after close are ignored.
        pipeline.feed_input(&input_frame(2));
        assert_eq!(pipeline.capture_len(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_audio_complete_returns_when_empty() {
        let pipeline = pipeline();
        let started = std::time::Instant::now();
        pipeline.wait_for_audio_complete(Duration::from_secs(1)).await;
        // Only the tail grace applies on an empty pipeline.
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_wait_for_audio_complete_bounded_with_stuck_frame() {
        let pipeline = pipeline();
        pipeline.write_audio(&encoded_output_frame(1));
        let started = std::time::Instant::now();
        pipeline.wait_for_audio_complete(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
