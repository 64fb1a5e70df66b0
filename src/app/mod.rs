//! The session orchestrator: sole owner of [`DeviceState`].
//!
//! Everything that can change session state (UI intent, backend messages,
//! wake-word detections, network failures) becomes a [`Command`] on one
//! serialized queue, consumed by a single task. All other tasks only read
//! state and react. Nothing below the transition boundary is allowed to
//! panic into the supervisor's loops.

pub mod commands;
pub mod supervisor;

use crate::audio::{AudioPipeline, PcmCodec, PLAYBACK_HIGH_WATER};
use crate::config::AppConfig;
use crate::display::{ui_channel, ConsoleDisplay, Display, UiEvent, UiEventReceiver, UiEventSender};
use crate::error::Result;
use crate::registry::{ResourceKind, ResourceRegistry, ResourceSpec, ShutdownReport};
use crate::state::{AbortReason, DeviceState, ListeningMode, SharedState};
use crate::things::{McpBridge, NullMcp, StaticThings, ThingRegistry};
use crate::transport::loopback::LoopbackTransport;
use crate::transport::{TransportChannel, TransportEvent, TransportEventReceiver};
use crate::wake::{EnergyDetector, EnergyDetectorConfig, WakeEvent, WakeWordGate};
use commands::{Command, CommandQueue};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use supervisor::TaskSupervisor;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Most encoded frames forwarded per cycle while listening.
const FORWARD_FRAMES_PER_CYCLE: usize = 10;

/// Notified after every real state transition. Failures are logged and do
/// not block later observers or the transition itself.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, old: DeviceState, new: DeviceState) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorTuning {
    pub queue_capacity: usize,
    pub command_poll_interval: Duration,
    pub status_poll_interval: Duration,
    pub playback_wait_timeout: Duration,
    /// Settle delay before re-opening listening after a wake-word abort.
    pub restart_settle_delay: Duration,
    pub task_grace: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        OrchestratorTuning {
            queue_capacity: 256,
            command_poll_interval: Duration::from_millis(100),
            status_poll_interval: Duration::from_millis(500),
            playback_wait_timeout: Duration::from_secs(10),
            restart_settle_delay: Duration::from_millis(100),
            task_grace: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

pub struct SessionOrchestrator {
    state: Arc<SharedState>,
    audio: Arc<AudioPipeline>,
    transport: Arc<dyn TransportChannel>,
    wake: Arc<WakeWordGate>,
    display: Arc<dyn Display>,
    things: Arc<dyn ThingRegistry>,
    mcp: Arc<dyn McpBridge>,
    registry: Arc<ResourceRegistry>,
    supervisor: Arc<TaskSupervisor>,
    queue: Arc<CommandQueue>,
    listening_mode: ListeningMode,
    tuning: OrchestratorTuning,
    running: AtomicBool,
    wake_restart_attempted: AtomicBool,
    wake_events: mpsc::Sender<WakeEvent>,
    wake_events_rx: Mutex<Option<mpsc::Receiver<WakeEvent>>>,
    transport_events_rx: Mutex<Option<TransportEventReceiver>>,
    ui_events: UiEventSender,
    ui_events_rx: Mutex<Option<UiEventReceiver>>,
    observers: Mutex<Vec<Box<dyn StateObserver>>>,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audio: Arc<AudioPipeline>,
        transport: Arc<dyn TransportChannel>,
        transport_events: TransportEventReceiver,
        wake: Arc<WakeWordGate>,
        display: Arc<dyn Display>,
        things: Arc<dyn ThingRegistry>,
        mcp: Arc<dyn McpBridge>,
        registry: Arc<ResourceRegistry>,
        listening_mode: ListeningMode,
        tuning: OrchestratorTuning,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::channel(16);
        let (ui_tx, ui_rx) = ui_channel();
        Arc::new(SessionOrchestrator {
            state: Arc::new(SharedState::new()),
            audio,
            transport,
            wake,
            display,
            things,
            mcp,
            registry,
            supervisor: TaskSupervisor::new(),
            queue: Arc::new(CommandQueue::new(tuning.queue_capacity)),
            listening_mode,
            tuning,
            running: AtomicBool::new(false),
            wake_restart_attempted: AtomicBool::new(false),
            wake_events: wake_tx,
            wake_events_rx: Mutex::new(Some(wake_rx)),
            transport_events_rx: Mutex::new(Some(transport_events)),
            ui_events: ui_tx,
            ui_events_rx: Mutex::new(Some(ui_rx)),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Sender the rendering layer uses to deliver user intent.
    pub fn ui_handle(&self) -> UiEventSender {
        self.ui_events.clone()
    }

    pub fn add_observer(&self, observer: Box<dyn StateObserver>) {
        match self.observers.lock() {
            Ok(mut guard) => guard.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Enqueue a command. Never blocks; logged and dropped once shutdown has
    /// begun.
    pub fn submit(&self, command: Command) {
        if !self.running.load(Ordering::SeqCst) {
            log::warn!("dropping command during shutdown: {command}");
            return;
        }
        self.queue.push(command);
    }

    pub fn start_listening(&self, mode: ListeningMode) {
        self.submit(Command::StartListening { mode });
    }

    pub fn stop_listening(&self) {
        self.submit(Command::StopListening);
    }

    pub fn toggle_chat_state(&self) {
        self.submit(Command::ToggleChat);
    }

    pub fn abort_speaking(&self, reason: AbortReason) {
        self.submit(Command::AbortSpeaking { reason });
    }

    pub fn send_text(&self, text: &str) {
        self.submit(Command::SendText {
            text: text.to_string(),
        });
    }

    /// Register every owned handle for ordered teardown and spawn the
    /// supervised tasks. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.register_resources().await;

        match self
            .wake
            .start(Arc::clone(&self.audio), self.wake_events.clone())
            .await
        {
            Ok(true) => {}
            Ok(false) => log::info!("starting without wake word detection"),
            Err(e) => {
                log::error!("wake word detector failed to start: {e}");
                self.wake.disable().await;
                self.alert("Wake word unavailable", &e.to_string()).await;
            }
        }

        let token = self.supervisor.cancel_token();
        self.spawn_command_processor(token.clone());
        self.spawn_transport_event_pump(token.clone());
        self.spawn_wake_event_pump(token.clone());
        self.spawn_ui_event_pump(token.clone());
        self.spawn_input_forwarder(token.clone());
        self.spawn_output_drainer(token.clone());
        self.spawn_status_poller(token);

        if let Err(e) = self.display.update_status("Standby", false).await {
            log::warn!("display update failed: {e}");
        }
        log::info!("session orchestrator started");
        Ok(())
    }

    /// Normal shutdown: stop accepting commands, then release everything
    /// through the registry's ordered teardown.
    pub async fn shutdown(&self) -> ShutdownReport {
        if !self.running.swap(false, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        log::info!("session shutting down");
        self.queue.push(Command::Shutdown);
        self.wake.stop().await;

        let report = self
            .registry
            .shutdown_all(self.tuning.shutdown_timeout, true)
            .await;

        let pending = self.queue.len();
        if pending > 0 {
            log::info!("discarding {pending} queued commands");
        }
        if self.queue.dropped_count() > 0 {
            log::info!("{} commands were dropped during the session", self.queue.dropped_count());
        }
        report
    }

    async fn register_resources(&self) {
        let display = Arc::clone(&self.display);
        self.registry
            .register(ResourceSpec::new_async("display", ResourceKind::Display, move || async move {
                display.close().await
            }))
            .await;

        let supervisor = Arc::clone(&self.supervisor);
        let grace = self.tuning.task_grace;
        self.registry
            .register(
                ResourceSpec::new_async("task-supervisor", ResourceKind::Task, move || async move {
                    supervisor.shutdown(grace).await;
                    Ok(())
                })
                .timeout(grace + Duration::from_secs(1)),
            )
            .await;

        let wake = Arc::clone(&self.wake);
        self.registry
            .register(ResourceSpec::new_async("wake-word-gate", ResourceKind::WakeWord, move || async move {
                wake.stop().await;
                Ok(())
            }))
            .await;

        let transport = Arc::clone(&self.transport);
        self.registry
            .register(ResourceSpec::new_async("transport-channel", ResourceKind::Transport, move || async move {
                transport.close_audio_channel().await
            }))
            .await;

        let audio = Arc::clone(&self.audio);
        self.registry
            .register(ResourceSpec::new_sync("audio-pipeline", ResourceKind::AudioDevice, move || {
                audio.close();
                Ok(())
            }))
            .await;
    }

    fn spawn_command_processor(self: &Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(self);
        self.supervisor.spawn("command-processor", async move {
            loop {
                if token.is_cancelled() {
                    return Ok(());
                }
                match this.queue.pop_timeout(this.tuning.command_poll_interval).await {
                    Some(Command::Shutdown) => return Ok(()),
                    Some(command) => this.dispatch(command).await,
                    None => {}
                }
            }
        });
    }

    fn spawn_transport_event_pump(self: &Arc<Self>, token: CancellationToken) {
        let Some(mut rx) = take_receiver(&self.transport_events_rx) else {
            return;
        };
        let this = Arc::clone(self);
        self.supervisor.spawn("transport-events", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    event = rx.recv() => match event {
                        Some(TransportEvent::NetworkError(message)) => {
                            this.queue.push(Command::NetworkError { message });
                        }
                        Some(TransportEvent::IncomingAudio(frame)) => {
                            // Straight into the decode queue; no state change.
                            this.audio.write_audio(&frame);
                        }
                        Some(TransportEvent::IncomingJson(payload)) => {
                            this.queue.push(Command::IncomingJson { payload });
                        }
                        Some(TransportEvent::AudioChannelOpened) => {
                            this.queue.push(Command::AudioChannelOpened);
                        }
                        Some(TransportEvent::AudioChannelClosed) => {
                            this.queue.push(Command::AudioChannelClosed);
                        }
                        None => return Ok(()),
                    }
                }
            }
        });
    }

    fn spawn_wake_event_pump(self: &Arc<Self>, token: CancellationToken) {
        let Some(mut rx) = take_receiver(&self.wake_events_rx) else {
            return;
        };
        let this = Arc::clone(self);
        self.supervisor.spawn("wake-events", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    event = rx.recv() => match event {
                        Some(WakeEvent::Detected { phrase }) => {
                            this.queue.push(Command::WakeWordDetected { phrase });
                        }
                        Some(WakeEvent::Failed { error }) => {
                            this.queue.push(Command::WakeWordFailed { error });
                        }
                        None => return Ok(()),
                    }
                }
            }
        });
    }

    fn spawn_ui_event_pump(self: &Arc<Self>, token: CancellationToken) {
        let Some(mut rx) = take_receiver(&self.ui_events_rx) else {
            return;
        };
        let this = Arc::clone(self);
        self.supervisor.spawn("ui-events", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    event = rx.recv() => match event {
                        Some(UiEvent::ToggleChat) => this.queue.push(Command::ToggleChat),
                        Some(UiEvent::StartListening(mode)) => {
                            this.queue.push(Command::StartListening { mode });
                        }
                        Some(UiEvent::StopListening) => this.queue.push(Command::StopListening),
                        Some(UiEvent::Abort) => this.queue.push(Command::AbortSpeaking {
                            reason: AbortReason::UserInterruption,
                        }),
                        Some(UiEvent::SendText(text)) => this.queue.push(Command::SendText { text }),
                        None => return Ok(()),
                    }
                }
            }
        });
    }

    /// While listening with an open channel, forward up to a handful of
    /// encoded frames per cycle. Short sleep after a busy cycle, longer when
    /// idle, to balance latency against CPU.
    fn spawn_input_forwarder(self: &Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(self);
        self.supervisor.spawn("audio-forwarder", async move {
            loop {
                if token.is_cancelled() {
                    return Ok(());
                }
                let active = this.state.device_state() == DeviceState::Listening
                    && this.transport.is_audio_channel_opened();
                if !active {
                    bounded_sleep(&token, Duration::from_millis(50)).await;
                    continue;
                }
                let mut sent = 0;
                while sent < FORWARD_FRAMES_PER_CYCLE {
                    let Some(frame) = this.audio.read_audio() else {
                        break;
                    };
                    if let Err(e) = this.transport.send_audio(frame).await {
                        log::warn!("audio send failed: {e}");
                        this.queue.push(Command::NetworkError {
                            message: e.to_string(),
                        });
                        break;
                    }
                    sent += 1;
                }
                let delay = if sent > 0 { 10 } else { 30 };
                bounded_sleep(&token, Duration::from_millis(delay)).await;
            }
        });
    }

    /// While speaking, move decoded frames into the playback ring and keep
    /// `is_tts_playing` truthful. The ring's high-water mark provides the
    /// pacing; the device callback drains at real time.
    fn spawn_output_drainer(self: &Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(self);
        self.supervisor.spawn("audio-drainer", async move {
            loop {
                if token.is_cancelled() {
                    return Ok(());
                }
                if this.state.device_state() != DeviceState::Speaking {
                    bounded_sleep(&token, Duration::from_millis(50)).await;
                    continue;
                }
                if this.audio.playback_backlog() > PLAYBACK_HIGH_WATER {
                    bounded_sleep(&token, Duration::from_millis(20)).await;
                    continue;
                }
                match this.audio.pop_decoded() {
                    Some(frame) => {
                        this.state.set_tts_playing(true);
                        this.audio.queue_playback(&frame);
                    }
                    None => {
                        bounded_sleep(&token, Duration::from_millis(20)).await;
                    }
                }
            }
        });
    }

    /// Recompute the status line and push it only when it changed; refresh
    /// text/emotion at a light cadence.
    fn spawn_status_poller(self: &Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(self);
        self.supervisor.spawn("status-poller", async move {
            let mut last: Option<(DeviceState, bool)> = None;
            let mut tick = 0u32;
            loop {
                if token.is_cancelled() {
                    return Ok(());
                }
                let state = this.state.device_state();
                let connected = this.transport.is_audio_channel_opened();
                if last != Some((state, connected)) {
                    if let Err(e) = this
                        .display
                        .update_status(status_line(state), connected)
                        .await
                    {
                        log::warn!("status update failed: {e}");
                    }
                    last = Some((state, connected));
                }
                tick = tick.wrapping_add(1);
                if tick % 10 == 0 {
                    let text = this.state.current_text();
                    if let Err(e) = this.display.update_text(&text).await {
                        log::warn!("text update failed: {e}");
                    }
                    let emotion = this.state.current_emotion();
                    if let Err(e) = this.display.update_emotion(&emotion).await {
                        log::warn!("emotion update failed: {e}");
                    }
                }
                bounded_sleep(&token, this.tuning.status_poll_interval).await;
            }
        });
    }

    pub(crate) async fn dispatch(&self, command: Command) {
        log::debug!("command: {command}");
        match command {
            Command::StartListening { mode } => self.handle_start_listening(mode).await,
            Command::StopListening => self.handle_stop_listening().await,
            Command::ToggleChat => self.handle_toggle().await,
            Command::AbortSpeaking { reason } => self.handle_abort(reason).await,
            Command::SetDeviceState { target } => self.set_state(target).await,
            Command::WakeWordDetected { phrase } => self.handle_wake_detected(&phrase).await,
            Command::WakeWordFailed { error } => self.handle_wake_failed(&error).await,
            Command::IncomingJson { payload } => self.handle_incoming_json(payload).await,
            Command::NetworkError { message } => self.handle_network_error(&message).await,
            Command::AudioChannelOpened => self.handle_channel_opened().await,
            Command::AudioChannelClosed => self.handle_channel_closed().await,
            Command::SendText { text } => self.handle_send_text(&text).await,
            Command::Shutdown => {}
        }
    }

    /// The single state-transition routine. No-op when the target equals the
    /// current state; otherwise performs the target's entry effects and then
    /// notifies observers.
    async fn set_state(&self, target: DeviceState) {
        let current = self.state.device_state();
        if current == target {
            return;
        }
        log::info!("device state: {current} -> {target}");

        // Queue hygiene comes before the state write so no task sees the new
        // state with stale audio still buffered.
        match target {
            DeviceState::Idle => {
                self.audio.clear_audio_queue();
            }
            DeviceState::Speaking => {
                // Keep capture running so wake-word detection still hears,
                // but drop anything buffered so playback is not re-captured.
                self.audio.clear_capture();
            }
            _ => {}
        }

        self.state.set_device_state(target);

        match target {
            DeviceState::Idle => {
                self.state.set_current_emotion("neutral");
                self.wake.resume();
                self.push_status(target).await;
                if let Err(e) = self.display.update_emotion("neutral").await {
                    log::warn!("emotion update failed: {e}");
                }
            }
            DeviceState::Connecting => {
                self.push_status(target).await;
            }
            DeviceState::Listening => {
                self.audio.resume_input();
                self.wake.pause();
                self.push_status(target).await;
                if self.transport.is_audio_channel_opened() {
                    match self.things.states_json().await {
                        Ok(states) => {
                            if let Err(e) = self.transport.send_iot_states(&states).await {
                                log::warn!("thing state push failed: {e}");
                            }
                        }
                        Err(e) => log::warn!("thing state snapshot failed: {e}"),
                    }
                }
            }
            DeviceState::Speaking => {
                self.wake.resume();
                self.push_status(target).await;
            }
        }

        let observers = match self.observers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for observer in observers.iter() {
            if let Err(e) = observer.on_state_change(current, target) {
                log::warn!("state observer failed: {e}");
            }
        }
    }

    async fn push_status(&self, state: DeviceState) {
        let connected = self.transport.is_audio_channel_opened();
        if let Err(e) = self.display.update_status(status_line(state), connected).await {
            log::warn!("status update failed: {e}");
        }
    }

    async fn alert(&self, title: &str, message: &str) {
        log::error!("{title}: {message}");
        if let Err(e) = self.display.alert(title, message).await {
            log::warn!("alert delivery failed: {e}");
        }
    }

    /// Open the control connection and audio channel if needed. False means
    /// the session must fall back to idle.
    async fn ensure_channel(&self) -> bool {
        if self.transport.is_audio_channel_opened() {
            return true;
        }
        match self.transport.connect().await {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("backend refused connection");
                return false;
            }
            Err(e) => {
                log::warn!("connect failed: {e}");
                return false;
            }
        }
        match self.transport.open_audio_channel().await {
            Ok(true) => true,
            Ok(false) => {
                log::warn!("backend refused audio channel");
                false
            }
            Err(e) => {
                log::warn!("audio channel open failed: {e}");
                false
            }
        }
    }

    /// Input hygiene before a listening phase: stale buffers go, and the
    /// capture stream is rebuilt in case clearing alone is not enough.
    fn prepare_input(&self) {
        self.audio.clear_audio_queue();
        if let Err(e) = self.audio.reinitialize_stream(true) {
            log::warn!("input stream reinit failed: {e}");
        }
    }

    async fn handle_start_listening(&self, mode: ListeningMode) {
        if self.state.device_state() != DeviceState::Idle {
            log::debug!("ignoring start listening outside idle");
            return;
        }
        self.state
            .set_keep_listening(!matches!(mode, ListeningMode::Manual));
        self.set_state(DeviceState::Connecting).await;

        if !self.ensure_channel().await {
            self.alert("Connection failed", "could not open the audio channel")
                .await;
            self.set_state(DeviceState::Idle).await;
            return;
        }

        self.prepare_input();
        if let Err(e) = self.transport.send_start_listening(mode).await {
            self.alert("Listening failed", &e.to_string()).await;
            if let Err(close_err) = self.transport.close_audio_channel().await {
                log::warn!("channel close failed: {close_err}");
            }
            self.set_state(DeviceState::Idle).await;
            return;
        }
        self.set_state(DeviceState::Listening).await;
    }

    async fn handle_stop_listening(&self) {
        if self.state.device_state() == DeviceState::Listening {
            if let Err(e) = self.transport.send_stop_listening().await {
                log::warn!("stop listening send failed: {e}");
            }
        }
        self.set_state(DeviceState::Idle).await;
    }

    async fn handle_toggle(&self) {
        match self.state.device_state() {
            DeviceState::Idle => self.handle_start_listening(self.listening_mode).await,
            DeviceState::Speaking => self.handle_abort(AbortReason::None).await,
            DeviceState::Listening => {
                if let Err(e) = self.transport.close_audio_channel().await {
                    log::warn!("channel close failed: {e}");
                }
                self.set_state(DeviceState::Idle).await;
            }
            DeviceState::Connecting => {
                log::debug!("toggle ignored while connecting");
            }
        }
    }

    /// Exactly one abort side-effect pass per abort request: an overlapping
    /// trigger (say wake word plus user interrupt) sees the in-flight flag
    /// and backs off. The flag clears at the next successful speech start.
    async fn handle_abort(&self, reason: AbortReason) {
        if !self.state.begin_abort() {
            log::debug!("abort already in flight, ignoring ({reason})");
            return;
        }
        log::info!("aborting speech ({reason})");
        let restart = reason == AbortReason::WakeWordDetected
            && self.state.keep_listening()
            && self.transport.is_audio_channel_opened();

        self.audio.clear_audio_queue();
        self.state.set_tts_playing(false);
        if let Err(e) = self.transport.send_abort_speaking(reason).await {
            log::warn!("abort send failed: {e}");
        }
        self.set_state(DeviceState::Idle).await;

        if restart {
            tokio::time::sleep(self.tuning.restart_settle_delay).await;
            match self.transport.send_start_listening(self.listening_mode).await {
                Ok(()) => self.set_state(DeviceState::Listening).await,
                Err(e) => {
                    log::warn!("listen restart after abort failed: {e}");
                    self.state.clear_abort();
                }
            }
        }
    }

    async fn handle_incoming_json(&self, payload: Value) {
        match payload["type"].as_str() {
            Some("tts") => self.handle_tts_message(&payload).await,
            Some("stt") => {
                if let Some(text) = payload["text"].as_str() {
                    self.state.set_current_text(text);
                    if let Err(e) = self.display.update_text(text).await {
                        log::warn!("text update failed: {e}");
                    }
                }
            }
            Some("llm") => {
                if let Some(emotion) = payload["emotion"].as_str() {
                    self.state.set_current_emotion(emotion);
                    if let Err(e) = self.display.update_emotion(emotion).await {
                        log::warn!("emotion update failed: {e}");
                    }
                }
            }
            Some("iot") => {
                if let Err(e) = self.things.invoke(&payload).await {
                    log::warn!("thing command failed: {e}");
                }
            }
            Some("mcp") => {
                match self.mcp.handle(payload["payload"].clone()).await {
                    Ok(Some(reply)) => {
                        if let Err(e) = self.transport.send_mcp_message(reply).await {
                            log::warn!("mcp reply send failed: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("mcp handler failed: {e}"),
                }
            }
            other => log::warn!("unhandled message type {other:?}: {payload}"),
        }
    }

    async fn handle_tts_message(&self, payload: &Value) {
        match payload["state"].as_str() {
            Some("start") => {
                // A new speech turn clears any stale abort marker.
                self.state.clear_abort();
                self.state.set_tts_playing(true);
                let current = self.state.device_state();
                if current == DeviceState::Idle || current == DeviceState::Listening {
                    self.set_state(DeviceState::Speaking).await;
                }
            }
            Some("stop") => {
                if self.state.device_state() == DeviceState::Speaking {
                    // Bounded wait so the tail of the utterance is not cut.
                    self.audio
                        .wait_for_audio_complete(self.tuning.playback_wait_timeout)
                        .await;
                    self.state.set_tts_playing(false);
                    if self.state.keep_listening() {
                        match self.transport.send_start_listening(self.listening_mode).await {
                            Ok(()) => self.set_state(DeviceState::Listening).await,
                            Err(e) => {
                                log::warn!("listen resume after speech failed: {e}");
                                self.set_state(DeviceState::Idle).await;
                            }
                        }
                    } else {
                        self.set_state(DeviceState::Idle).await;
                    }
                } else {
                    self.state.set_tts_playing(false);
                }
            }
            Some("sentence_start") => {
                if let Some(text) = payload["text"].as_str() {
                    self.state.set_current_text(text);
                    if let Err(e) = self.display.update_text(text).await {
                        log::warn!("text update failed: {e}");
                    }
                }
            }
            other => log::debug!("unhandled tts state {other:?}"),
        }
    }

    async fn handle_network_error(&self, message: &str) {
        self.state.set_keep_listening(false);
        self.alert("Network error", message).await;
        self.set_state(DeviceState::Idle).await;
        if let Err(e) = self.transport.close_audio_channel().await {
            log::warn!("channel close failed: {e}");
        }
    }

    /// Announce the device-control surface as soon as the channel is up.
    async fn handle_channel_opened(&self) {
        match self.things.descriptors_json().await {
            Ok(descriptors) => {
                if let Err(e) = self.transport.send_iot_descriptors(&descriptors).await {
                    log::warn!("descriptor push failed: {e}");
                }
            }
            Err(e) => log::warn!("descriptor snapshot failed: {e}"),
        }
        match self.things.states_json().await {
            Ok(states) => {
                if let Err(e) = self.transport.send_iot_states(&states).await {
                    log::warn!("thing state push failed: {e}");
                }
            }
            Err(e) => log::warn!("thing state snapshot failed: {e}"),
        }
    }

    async fn handle_channel_closed(&self) {
        self.state.set_keep_listening(false);
        self.set_state(DeviceState::Idle).await;
    }

    async fn handle_wake_detected(&self, phrase: &str) {
        match self.state.device_state() {
            DeviceState::Idle => {
                self.wake.pause();
                self.set_state(DeviceState::Connecting).await;
                if !self.ensure_channel().await {
                    self.alert("Connection failed", "could not reach the backend")
                        .await;
                    // Re-entering idle resumes the gate.
                    self.set_state(DeviceState::Idle).await;
                    return;
                }
                self.prepare_input();
                if let Err(e) = self.transport.send_wake_word_detected(phrase).await {
                    log::warn!("wake word report failed: {e}");
                    self.set_state(DeviceState::Idle).await;
                    return;
                }
                self.state.set_keep_listening(true);
                if let Err(e) = self.transport.send_start_listening(self.listening_mode).await {
                    log::warn!("start listening failed: {e}");
                    self.set_state(DeviceState::Idle).await;
                    return;
                }
                self.set_state(DeviceState::Listening).await;
            }
            DeviceState::Speaking => {
                self.handle_abort(AbortReason::WakeWordDetected).await;
            }
            other => log::debug!("wake word ignored in state {other}"),
        }
    }

    /// One supervised restart, then the gate is disabled for the session.
    async fn handle_wake_failed(&self, error: &str) {
        log::error!("wake word detector failed: {error}");
        if !self.wake_restart_attempted.swap(true, Ordering::SeqCst) {
            match self
                .wake
                .restart(Arc::clone(&self.audio), self.wake_events.clone())
                .await
            {
                Ok(true) => {
                    log::info!("wake word detector restarted");
                    return;
                }
                Ok(false) => {}
                Err(e) => log::error!("wake word restart failed: {e}"),
            }
        }
        self.wake.disable().await;
        self.alert("Wake word disabled", "detector kept failing; disabled for this session")
            .await;
    }

    /// Text entry path: same upstream message as a spoken wake word.
    async fn handle_send_text(&self, text: &str) {
        if !self.ensure_channel().await {
            self.alert("Connection failed", "could not send text").await;
            return;
        }
        if let Err(e) = self.transport.send_wake_word_detected(text).await {
            self.alert("Send failed", &e.to_string()).await;
        }
    }
}

fn status_line(state: DeviceState) -> &'static str {
    match state {
        DeviceState::Idle => "Standby",
        DeviceState::Connecting => "Connecting...",
        DeviceState::Listening => "Listening...",
        DeviceState::Speaking => "Speaking...",
    }
}

fn take_receiver<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

async fn bounded_sleep(token: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Composition root: builds and wires every component once, runs until the
/// user quits or the process is interrupted, then tears down in order.
pub async fn run(config: AppConfig, registry: Arc<ResourceRegistry>) -> Result<()> {
    let audio = AudioPipeline::new(Box::new(PcmCodec));
    audio.initialize()?;

    let (event_tx, event_rx) = crate::transport::event_channel();
    let transport: Arc<dyn TransportChannel> = Arc::new(LoopbackTransport::new(event_tx));
    log::info!("using loopback transport (endpoint {} unused)", config.server_url);

    let detector = EnergyDetector::new(EnergyDetectorConfig {
        threshold: config.wake_threshold,
        ..EnergyDetectorConfig::default()
    });
    let wake = WakeWordGate::new(detector, config.wake_word_enabled);
    let display: Arc<dyn Display> = Arc::new(ConsoleDisplay::new());
    let things: Arc<dyn ThingRegistry> = Arc::new(StaticThings::speaker());
    let mcp: Arc<dyn McpBridge> = Arc::new(NullMcp);

    let tuning = OrchestratorTuning {
        queue_capacity: config.command_queue_size,
        playback_wait_timeout: config.playback_wait_timeout,
        shutdown_timeout: config.shutdown_timeout,
        ..OrchestratorTuning::default()
    };
    let orchestrator = SessionOrchestrator::new(
        audio,
        transport,
        event_rx,
        wake,
        display,
        things,
        mcp,
        registry,
        config.listening_mode,
        tuning,
    );
    orchestrator.start().await?;

    let ui = orchestrator.ui_handle();
    let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        println!("commands: t=toggle chat, s=stop listening, a=abort, q=quit, anything else is sent as text");
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            let event = match line {
                "" => continue,
                "q" | "quit" => {
                    let _ = quit_tx.send(()).await;
                    break;
                }
                "t" => UiEvent::ToggleChat,
                "s" => UiEvent::StopListening,
                "a" => UiEvent::Abort,
                text => UiEvent::SendText(text.to_string()),
            };
            if ui.send(event).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("interrupt received"),
        _ = quit_rx.recv() => log::info!("quit requested"),
    }

    let report = orchestrator.shutdown().await;
    if !report.is_clean() {
        log::warn!(
            "teardown finished with {} failed and {} forced resources",
            report.failed,
            report.forced
        );
    }
    Ok(())
}
