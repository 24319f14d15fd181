//! # Call Session Driver
//!
//! The async half of the session: a tokio task that feeds events into the
//! state machine and executes the actions it returns against the real world
//! (WebSocket transport, audio devices, timers).
//!
//! ## Ownership:
//! `CallSession` is the public handle; it only sends events. The driver task
//! exclusively owns the transport, the playback pipeline and (once started)
//! the capture pipeline, so every device handle has exactly one release
//! point. Dropping the handle sends `Shutdown`, which runs the same cleanup
//! as an explicit call.
//!
//! ## Device Opening:
//! Opening audio devices blocks, so it runs on the blocking pool and reports
//! back through an internal channel. The state machine's lazy-init rules
//! (queue playback before the sink attaches, complete listening only when
//! the mic is up) absorb the latency.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::capture::{CaptureBackend, CapturePipeline};
use crate::audio::device::{CpalCaptureBackend, CpalPlaybackSink};
use crate::audio::playback::{end_call_tone, MonotonicClock, PlaybackPipeline, PlaybackSink};
use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::session::state::{
    Action, CallStatus, SessionEvent, SessionState, UiEvent, BATCH_INTERVAL_MS, RECONNECT_DELAY_MS,
};
use crate::websocket::{SessionTransport, TransportEvent};

/// Generate a fresh session id for a new call.
pub fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Factories for the audio device seams.
///
/// The driver opens devices lazily and may open the playback side twice (the
/// call sink and the short-lived end-tone sink), so it takes factories
/// rather than instances. Tests inject stubs here.
#[derive(Clone)]
pub struct AudioDevices {
    capture: std::sync::Arc<dyn Fn() -> Box<dyn CaptureBackend> + Send + Sync>,
    playback: std::sync::Arc<dyn Fn() -> ClientResult<Box<dyn PlaybackSink>> + Send + Sync>,
}

impl AudioDevices {
    pub fn new(
        capture: impl Fn() -> Box<dyn CaptureBackend> + Send + Sync + 'static,
        playback: impl Fn() -> ClientResult<Box<dyn PlaybackSink>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            capture: std::sync::Arc::new(capture),
            playback: std::sync::Arc::new(playback),
        }
    }

    /// The system's default microphone and speaker via cpal.
    pub fn system(capture_rate: u32) -> Self {
        Self::new(
            move || Box::new(CpalCaptureBackend::new(capture_rate)),
            || Ok(Box::new(CpalPlaybackSink::open()?) as Box<dyn PlaybackSink>),
        )
    }
}

/// Results of blocking device opens, delivered back to the driver task.
enum DriverMsg {
    CaptureReady {
        pipeline: CapturePipeline,
        result: ClientResult<()>,
    },
    PlaybackReady(ClientResult<Box<dyn PlaybackSink>>),
}

/// Public handle to a running call session.
///
/// All methods are fire-and-forget event sends; outcomes arrive on the
/// `UiEvent` receiver returned by `start`/`with_devices`.
pub struct CallSession {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl CallSession {
    /// Spawn a session driver using the system audio devices.
    pub fn start(
        config: ClientConfig,
        session_id: String,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let capture_rate = config.audio.capture_rate;
        Self::with_devices(config, session_id, AudioDevices::system(capture_rate))
    }

    /// Spawn a session driver with explicit device factories.
    pub fn with_devices(
        config: ClientConfig,
        session_id: String,
        devices: AudioDevices,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        let transport =
            SessionTransport::new(config.endpoint.clone(), session_id.clone(), transport_tx);
        let playback = PlaybackPipeline::new(
            config.audio.playback_rate,
            Box::new(MonotonicClock::new()),
        );

        info!(session = %session_id, "call session created");

        let driver = Driver {
            state: SessionState::new(session_id),
            transport,
            playback,
            capture: None,
            capture_opening: false,
            playback_requested: false,
            devices,
            events_tx: events_tx.clone(),
            events_rx,
            transport_rx,
            internal_tx,
            internal_rx,
            ui_tx,
            batch_timer: None,
            duration_timer: None,
        };
        tokio::spawn(driver.run());

        (Self { events: events_tx }, ui_rx)
    }

    pub fn start_call(&self) {
        self.send(SessionEvent::StartCall);
    }

    pub fn start_speaking(&self) {
        self.send(SessionEvent::StartSpeaking);
    }

    pub fn stop_speaking(&self) {
        self.send(SessionEvent::StopSpeaking);
    }

    pub fn end_call(&self) {
        self.send(SessionEvent::EndCall);
    }

    /// Immediate cleanup without the confirmation tone or grace delay.
    pub fn shutdown(&self) {
        self.send(SessionEvent::Shutdown);
    }

    fn send(&self, event: SessionEvent) {
        // A closed channel means the driver already finished; nothing to do.
        let _ = self.events.send(event);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let _ = self.events.send(SessionEvent::Shutdown);
    }
}

struct Driver {
    state: SessionState,
    transport: SessionTransport,
    playback: PlaybackPipeline,
    capture: Option<CapturePipeline>,
    capture_opening: bool,
    playback_requested: bool,
    devices: AudioDevices,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<DriverMsg>,
    internal_rx: mpsc::UnboundedReceiver<DriverMsg>,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
    batch_timer: Option<JoinHandle<()>>,
    duration_timer: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break, // handle dropped and Shutdown already processed
                },
                Some(event) = self.transport_rx.recv() => {
                    self.dispatch(map_transport_event(event));
                }
                Some(msg) = self.internal_rx.recv() => self.handle_internal(msg),
            }

            if self.state.status() == CallStatus::Ended {
                break;
            }
        }
        self.cleanup();
    }

    fn dispatch(&mut self, event: SessionEvent) {
        let actions = self.state.apply(event);
        for action in actions {
            self.perform(action);
        }
    }

    fn handle_internal(&mut self, msg: DriverMsg) {
        match msg {
            DriverMsg::CaptureReady { pipeline, result } => {
                self.capture_opening = false;
                match result {
                    Ok(()) => {
                        self.capture = Some(pipeline);
                        self.dispatch(SessionEvent::CaptureStarted);
                    }
                    Err(e) => self.dispatch(SessionEvent::CaptureFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            DriverMsg::PlaybackReady(result) => match result {
                Ok(sink) => self.playback.attach(sink),
                Err(e) => {
                    // No output device: the call continues, audio is lost.
                    warn!("playback unavailable: {}", e);
                    self.playback.stop();
                }
            },
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Connect { mode, epoch } => self.transport.connect(mode, epoch),
            Action::SendFrame { payload } => self.transport.send(payload),
            Action::CloseSocket => self.transport.close(),
            Action::StartCapture => self.start_capture(),
            Action::StopCapture => {
                if let Some(mut pipeline) = self.capture.take() {
                    pipeline.stop();
                }
            }
            Action::StartBatchTimer => self.start_batch_timer(),
            Action::StopBatchTimer => {
                if let Some(handle) = self.batch_timer.take() {
                    handle.abort();
                }
            }
            Action::StartPlayback => self.start_playback(),
            Action::EnqueueAudio { bytes } => {
                self.playback.enqueue(&bytes);
            }
            Action::FlushPlayback => {
                self.playback.flush();
            }
            Action::StopPlayback => self.playback.stop(),
            Action::PlayEndTone => self.play_end_tone(),
            Action::ScheduleReconnect => {
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
                    let _ = events.send(SessionEvent::ReconnectDelayElapsed);
                });
            }
            Action::ScheduleEnd { delay_ms } => {
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = events.send(SessionEvent::EndDelayElapsed);
                });
            }
            Action::Emit(event) => {
                if matches!(event, UiEvent::Connected(true)) {
                    self.start_duration_timer();
                }
                let _ = self.ui_tx.send(event);
            }
        }
    }

    fn start_capture(&mut self) {
        if self.capture.is_some() || self.capture_opening {
            return;
        }
        self.capture_opening = true;

        let factory = self.devices.capture.clone();
        let events = self.events_tx.clone();
        let internal = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut pipeline = CapturePipeline::new(factory());
            let chunk_events = events.clone();
            let result = pipeline.start(move |bytes, level| {
                let _ = chunk_events.send(SessionEvent::ChunkCaptured { bytes, level });
            });
            let _ = internal.send(DriverMsg::CaptureReady { pipeline, result });
        });
    }

    fn start_playback(&mut self) {
        if self.playback_requested {
            return;
        }
        self.playback_requested = true;

        let factory = self.devices.playback.clone();
        let internal = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _ = internal.send(DriverMsg::PlaybackReady(factory()));
        });
    }

    fn play_end_tone(&mut self) {
        let factory = self.devices.playback.clone();
        tokio::task::spawn_blocking(move || match factory() {
            Ok(mut sink) => {
                let tone = end_call_tone(sink.sample_rate());
                sink.write(&tone);
                // Let the tone drain before the sink goes away.
                std::thread::sleep(Duration::from_millis(400));
                sink.close();
            }
            Err(e) => debug!("end tone skipped: {}", e),
        });
    }

    fn start_batch_timer(&mut self) {
        if self.batch_timer.is_some() {
            return;
        }
        let events = self.events_tx.clone();
        self.batch_timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(BATCH_INTERVAL_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if events.send(SessionEvent::BatchTimerFired).is_err() {
                    break;
                }
            }
        }));
    }

    fn start_duration_timer(&mut self) {
        if self.duration_timer.is_some() {
            return;
        }
        let ui = self.ui_tx.clone();
        self.duration_timer = Some(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await; // consume the immediate first tick
            loop {
                interval.tick().await;
                if ui.send(UiEvent::Duration(started.elapsed().as_secs())).is_err() {
                    break;
                }
            }
        }));
    }

    /// Final resource sweep when the driver task exits.
    fn cleanup(&mut self) {
        if let Some(handle) = self.batch_timer.take() {
            handle.abort();
        }
        if let Some(handle) = self.duration_timer.take() {
            handle.abort();
        }
        if let Some(mut pipeline) = self.capture.take() {
            pipeline.stop();
        }
        self.playback.stop();
        self.transport.close();
        debug!(session = %self.state.session_id(), "session driver finished");
    }
}

fn map_transport_event(event: TransportEvent) -> SessionEvent {
    match event {
        TransportEvent::Opened { epoch } => SessionEvent::SocketOpened { epoch },
        TransportEvent::Closed { epoch } => SessionEvent::SocketClosed { epoch },
        TransportEvent::Frame { epoch, frame } => SessionEvent::FrameReceived { epoch, frame },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::BlockHandler;
    use crate::config::ClientConfig;
    use tokio::time::timeout;

    struct NullCapture;

    impl CaptureBackend for NullCapture {
        fn open(&mut self, _on_block: BlockHandler) -> ClientResult<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct NullSink;

    impl PlaybackSink for NullSink {
        fn sample_rate(&self) -> u32 {
            24000
        }

        fn write(&mut self, _samples: &[f32]) {}

        fn close(&mut self) {}
    }

    fn test_devices() -> AudioDevices {
        AudioDevices::new(
            || Box::new(NullCapture),
            || Ok(Box::new(NullSink) as Box<dyn PlaybackSink>),
        )
    }

    /// Endpoint nothing listens on, so connects fail fast.
    fn unreachable_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.endpoint.scheme = "ws".to_string();
        config.endpoint.host = "127.0.0.1:9".to_string();
        config
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> UiEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for ui event")
            .expect("ui channel closed")
    }

    #[tokio::test]
    async fn test_failed_connect_reports_connection_lost() {
        let (session, mut ui) =
            CallSession::with_devices(unreachable_config(), "s1".to_string(), test_devices());
        session.start_call();

        assert_eq!(
            next_event(&mut ui).await,
            UiEvent::Status("Connecting...".to_string())
        );

        // The refused connection surfaces as a lost connection; a reconnect
        // gets scheduled behind the scenes.
        loop {
            match next_event(&mut ui).await {
                UiEvent::Status(s) if s == "Connection lost" => break,
                UiEvent::Connected(false) => {}
                other => panic!("unexpected ui event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_end_call_emits_call_ended_after_grace() {
        let (session, mut ui) =
            CallSession::with_devices(unreachable_config(), "s2".to_string(), test_devices());
        session.start_call();
        session.end_call();

        loop {
            if next_event(&mut ui).await == UiEvent::CallEnded {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_ends_quietly() {
        let (session, mut ui) =
            CallSession::with_devices(unreachable_config(), "s3".to_string(), test_devices());
        session.start_call();
        session.shutdown();

        loop {
            if next_event(&mut ui).await == UiEvent::CallEnded {
                break;
            }
        }
        // Driver is gone; the channel drains to closed.
        assert!(matches!(
            timeout(Duration::from_secs(1), ui.recv()).await,
            Ok(None)
        ));
    }

    #[test]
    fn test_generated_session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
