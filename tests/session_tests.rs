//! End-to-end session flows over the in-process loopback backend.

use std::sync::Arc;
use std::time::Duration;
use voxlink::app::{OrchestratorTuning, SessionOrchestrator};
use voxlink::audio::{AudioPipeline, PcmCodec, INPUT_FRAME_SAMPLES};
use voxlink::display::ConsoleDisplay;
use voxlink::registry::ResourceRegistry;
use voxlink::state::{AbortReason, DeviceState, ListeningMode, SharedState};
use voxlink::things::{NullMcp, StaticThings};
use voxlink::transport::loopback::LoopbackTransport;
use voxlink::transport::{event_channel, TransportChannel};
use voxlink::wake::{EnergyDetector, EnergyDetectorConfig, WakeWordGate};

struct Session {
    orchestrator: Arc<SessionOrchestrator>,
    audio: Arc<AudioPipeline>,
    registry: Arc<ResourceRegistry>,
}

fn build_session() -> Session {
    let audio = AudioPipeline::new(Box::new(PcmCodec));
    let (event_tx, event_rx) = event_channel();
    let transport: Arc<dyn TransportChannel> = Arc::new(LoopbackTransport::new(event_tx));
    // Detection is driven explicitly in these tests, so the gate stays off.
    let wake = WakeWordGate::new(
        EnergyDetector::new(EnergyDetectorConfig::default()),
        false,
    );
    let registry = ResourceRegistry::new();
    let tuning = OrchestratorTuning {
        playback_wait_timeout: Duration::from_millis(700),
        restart_settle_delay: Duration::from_millis(20),
        ..OrchestratorTuning::default()
    };
    let orchestrator = SessionOrchestrator::new(
        Arc::clone(&audio),
        transport,
        event_rx,
        wake,
        Arc::new(ConsoleDisplay::new()),
        Arc::new(StaticThings::speaker()),
        Arc::new(NullMcp),
        Arc::clone(&registry),
        ListeningMode::AutoStop,
        tuning,
    );
    Session {
        orchestrator,
        audio,
        registry,
    }
}

async fn wait_for_state(state: &SharedState, target: DeviceState, bound: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + bound;
    while tokio::time::Instant::now() < deadline {
        if state.device_state() == target {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[test_log::test(tokio::test)]
async fn test_full_voice_turn_round_trips() {
    let session = build_session();
    session.orchestrator.start().await.unwrap();
    let state = session.orchestrator.shared_state();

    session.orchestrator.toggle_chat_state();
    assert!(wait_for_state(&state, DeviceState::Listening, Duration::from_secs(2)).await);
    assert!(state.keep_listening());

    for _ in 0..10 {
        session.audio.feed_input(&vec![500i16; INPUT_FRAME_SAMPLES]);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.orchestrator.stop_listening();
    // The loopback backend answers a finished turn with a spoken reply.
    assert!(wait_for_state(&state, DeviceState::Speaking, Duration::from_secs(3)).await);
    assert!(state.is_tts_playing());

    // Auto-stop keeps the session going: after the reply, listening resumes.
    assert!(wait_for_state(&state, DeviceState::Listening, Duration::from_secs(5)).await);
    assert!(!state.is_tts_playing());

    let report = session.orchestrator.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(session.registry.tracked_count().await, 0);
}

#[test_log::test(tokio::test)]
async fn test_user_interruption_cuts_reply_short() {
    let session = build_session();
    session.orchestrator.start().await.unwrap();
    let state = session.orchestrator.shared_state();

    session.orchestrator.toggle_chat_state();
    assert!(wait_for_state(&state, DeviceState::Listening, Duration::from_secs(2)).await);
    session.orchestrator.stop_listening();
    assert!(wait_for_state(&state, DeviceState::Speaking, Duration::from_secs(3)).await);

    session
        .orchestrator
        .abort_speaking(AbortReason::UserInterruption);
    assert!(wait_for_state(&state, DeviceState::Idle, Duration::from_secs(2)).await);

    // A user interruption ends the session; the trailing reply events must
    // not restart listening.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(state.device_state(), DeviceState::Idle);
    assert_eq!(session.audio.playback_backlog(), 0);

    session.orchestrator.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_text_entry_gets_a_spoken_reply() {
    let session = build_session();
    session.orchestrator.start().await.unwrap();
    let state = session.orchestrator.shared_state();

    session.orchestrator.send_text("what time is it");
    assert!(wait_for_state(&state, DeviceState::Speaking, Duration::from_secs(3)).await);

    session.orchestrator.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_shutdown_mid_session_releases_everything() {
    let session = build_session();
    session.orchestrator.start().await.unwrap();
    let state = session.orchestrator.shared_state();

    session.orchestrator.toggle_chat_state();
    assert!(wait_for_state(&state, DeviceState::Listening, Duration::from_secs(2)).await);

    let report = session.orchestrator.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(session.registry.tracked_count().await, 0);

    // Commands submitted after shutdown are dropped, so the state can no
    // longer change.
    session.orchestrator.toggle_chat_state();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.device_state(), DeviceState::Listening);
}
