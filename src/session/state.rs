//! # Call State Machine
//!
//! The turn/call logic of a voice session as a pure state machine: one
//! `SessionState`, typed `SessionEvent`s in, a list of `Action`s out. The
//! driver in `call.rs` owns the clocks, sockets and devices and executes the
//! actions; everything here is synchronous and testable without any of them.
//!
//! ## Lifecycle:
//! idle → connecting → connected → (listening ⇄ not listening) → ending → ended
//! with connected → reconnecting → connected on socket drops.
//!
//! ## Epoch Guard:
//! Reconnection can leave a superseded socket task briefly alive. The state
//! carries a connection epoch that increases on every connect; events tagged
//! with a stale epoch are discarded, so a dying socket can never corrupt the
//! state of its replacement.
//!
//! ## Call Termination:
//! Two paths end a call. The user hangs up (`EndCall`): teardown runs
//! immediately and the UI is notified after a 500 ms grace delay. Or the
//! assistant says goodbye: the farewell only arms `pending_end`; the call
//! ends after the assistant *finishes* that turn (`turn_complete`), with a
//! 600 ms grace delay so the closing words are not clipped. Both paths
//! disable reconnection permanently before closing the socket.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::websocket::{audio_frame, QueryMode, ServerFrame};

/// How often buffered capture chunks are flushed to the wire.
pub const BATCH_INTERVAL_MS: u64 = 200;
/// Delay before reconnecting after an unexpected socket drop.
pub const RECONNECT_DELAY_MS: u64 = 3000;
/// Grace delay between teardown and UI notification on the farewell path.
pub const FAREWELL_GRACE_MS: u64 = 600;
/// Grace delay between teardown and UI notification on explicit hang-up.
pub const HANGUP_GRACE_MS: u64 = 500;

/// Coarse call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Ending,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Reconnecting => "reconnecting",
            CallStatus::Ending => "ending",
            CallStatus::Ended => "ended",
        }
    }
}

/// Who a transcript message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    User,
    Assistant,
}

/// One entry in the conversation transcript.
///
/// The transcript is append-only. The newest assistant message stays mutable
/// while its turn is open (text deltas append to it) and freezes on
/// `turn_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub sender: MessageSender,
    pub text: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

/// Events the state machine consumes.
#[derive(Debug)]
pub enum SessionEvent {
    // User intents
    StartCall,
    StartSpeaking,
    StopSpeaking,
    EndCall,
    /// Host is going away; cleanup without tone or grace delay.
    Shutdown,

    // Transport callbacks, tagged with the epoch of the socket they came from
    SocketOpened { epoch: u64 },
    SocketClosed { epoch: u64 },
    FrameReceived { epoch: u64, frame: ServerFrame },

    // Capture pipeline callbacks
    CaptureStarted,
    CaptureFailed { reason: String },
    ChunkCaptured { bytes: Vec<u8>, level: f32 },

    // Timers
    BatchTimerFired,
    ReconnectDelayElapsed,
    EndDelayElapsed,
}

/// Side effects the driver must execute, in order.
#[derive(Debug, PartialEq)]
pub enum Action {
    Connect { mode: QueryMode, epoch: u64 },
    SendFrame { payload: String },
    CloseSocket,
    StartCapture,
    StopCapture,
    StartBatchTimer,
    StopBatchTimer,
    StartPlayback,
    EnqueueAudio { bytes: Vec<u8> },
    FlushPlayback,
    StopPlayback,
    PlayEndTone,
    ScheduleReconnect,
    ScheduleEnd { delay_ms: u64 },
    Emit(UiEvent),
}

/// Events surfaced to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Human-readable status line ("Connecting...", "Listening...", ...).
    Status(String),
    Connected(bool),
    Listening(bool),
    /// Smoothed microphone loudness in [0, 1].
    AudioLevel(f32),
    MessageAdded(ConversationMessage),
    MessageUpdated(ConversationMessage),
    /// Seconds since the call connected.
    Duration(u64),
    CallEnded,
}

/// Whole-phrase, case-insensitive farewell test: "goodbye" or "good bye"
/// (any amount of whitespace between the words), bounded by non-word
/// characters. "goodbyes" and "a good bye-product" do not match.
pub fn contains_farewell(text: &str) -> bool {
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    let is_word = |c: char| c.is_alphanumeric();
    let len = chars.len();

    for i in 0..len {
        if i + 4 > len || chars[i..i + 4] != ['g', 'o', 'o', 'd'] {
            continue;
        }
        if i > 0 && is_word(chars[i - 1]) {
            continue;
        }
        let mut j = i + 4;
        while j < len && chars[j].is_whitespace() {
            j += 1;
        }
        if j + 3 > len || chars[j..j + 3] != ['b', 'y', 'e'] {
            continue;
        }
        if j + 3 == len || !is_word(chars[j + 3]) {
            return true;
        }
    }
    false
}

/// The call session's state.
pub struct SessionState {
    session_id: String,
    status: CallStatus,
    /// Connection epoch; increases on every connect attempt.
    epoch: u64,
    mode: QueryMode,
    socket_open: bool,
    is_listening: bool,
    /// `start_speaking` in progress: waiting for mic and/or audio socket.
    starting_mic: bool,
    mic_ready: bool,
    /// Farewell heard; end the call on the next completed turn.
    pending_end: bool,
    reconnect_enabled: bool,
    /// Capture chunks accumulated since the last batch flush.
    send_buffer: Vec<u8>,
    messages: Vec<ConversationMessage>,
    /// The newest assistant message is still receiving deltas.
    open_turn: bool,
}

impl SessionState {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            status: CallStatus::Idle,
            epoch: 0,
            mode: QueryMode::Text,
            socket_open: false,
            is_listening: false,
            starting_mic: false,
            mic_ready: false,
            pending_end: false,
            reconnect_enabled: true,
            send_buffer: Vec::new(),
            messages: Vec::new(),
            open_turn: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_listening(&self) -> bool {
        self.is_listening
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Apply one event and return the side effects to execute, in order.
    pub fn apply(&mut self, event: SessionEvent) -> Vec<Action> {
        match event {
            SessionEvent::StartCall => self.on_start_call(),
            SessionEvent::StartSpeaking => self.on_start_speaking(),
            SessionEvent::StopSpeaking => self.on_stop_speaking(),
            SessionEvent::EndCall => self.on_end_call(),
            SessionEvent::Shutdown => self.on_shutdown(),
            SessionEvent::SocketOpened { epoch } => self.on_socket_opened(epoch),
            SessionEvent::SocketClosed { epoch } => self.on_socket_closed(epoch),
            SessionEvent::FrameReceived { epoch, frame } => self.on_frame(epoch, frame),
            SessionEvent::CaptureStarted => self.on_capture_started(),
            SessionEvent::CaptureFailed { reason } => self.on_capture_failed(reason),
            SessionEvent::ChunkCaptured { bytes, level } => self.on_chunk(bytes, level),
            SessionEvent::BatchTimerFired => self.on_batch_timer(),
            SessionEvent::ReconnectDelayElapsed => self.on_reconnect_elapsed(),
            SessionEvent::EndDelayElapsed => self.on_end_elapsed(),
        }
    }

    fn terminal(&self) -> bool {
        matches!(self.status, CallStatus::Ending | CallStatus::Ended)
    }

    fn on_start_call(&mut self) -> Vec<Action> {
        if self.status != CallStatus::Idle {
            debug!(session = %self.session_id, "start_call ignored: already started");
            return Vec::new();
        }

        self.status = CallStatus::Connecting;
        self.epoch += 1;
        self.mode = QueryMode::Text;
        vec![
            Action::Emit(UiEvent::Status("Connecting...".to_string())),
            Action::Connect {
                mode: QueryMode::Text,
                epoch: self.epoch,
            },
        ]
    }

    fn on_socket_opened(&mut self, epoch: u64) -> Vec<Action> {
        if epoch != self.epoch {
            debug!(stale = epoch, current = self.epoch, "stale socket open ignored");
            return Vec::new();
        }
        if self.terminal() {
            return Vec::new();
        }

        self.socket_open = true;
        self.status = CallStatus::Connected;

        let mut actions = vec![
            Action::Emit(UiEvent::Connected(true)),
            Action::Emit(UiEvent::Status("Connected".to_string())),
        ];

        // start_speaking may have been waiting on this socket.
        if self.starting_mic && self.mic_ready && self.mode == QueryMode::Audio {
            actions.extend(self.complete_listening());
        }
        actions
    }

    fn on_socket_closed(&mut self, epoch: u64) -> Vec<Action> {
        if epoch != self.epoch {
            debug!(stale = epoch, current = self.epoch, "stale socket close ignored");
            return Vec::new();
        }

        self.socket_open = false;
        if self.terminal() {
            // Expected during teardown.
            return Vec::new();
        }

        self.status = CallStatus::Reconnecting;
        let mut actions = vec![
            Action::Emit(UiEvent::Connected(false)),
            Action::Emit(UiEvent::Status("Connection lost".to_string())),
        ];
        if self.reconnect_enabled {
            actions.push(Action::ScheduleReconnect);
        }
        actions
    }

    fn on_reconnect_elapsed(&mut self) -> Vec<Action> {
        if !self.reconnect_enabled || self.terminal() || self.socket_open {
            return Vec::new();
        }

        self.epoch += 1;
        vec![
            Action::Emit(UiEvent::Status("Reconnecting...".to_string())),
            Action::Connect {
                mode: self.mode,
                epoch: self.epoch,
            },
        ]
    }

    fn on_start_speaking(&mut self) -> Vec<Action> {
        if self.is_listening || self.starting_mic || self.terminal() {
            debug!("start_speaking ignored");
            return Vec::new();
        }

        self.starting_mic = true;
        self.mic_ready = false;

        let mut actions = vec![Action::StartPlayback, Action::StartCapture];

        // The audio pipeline needs an audio-mode socket; reopen if the
        // current one is text-mode or down.
        if !(self.socket_open && self.mode == QueryMode::Audio) {
            self.epoch += 1;
            self.mode = QueryMode::Audio;
            self.socket_open = false;
            actions.push(Action::Emit(UiEvent::Status(
                "Switching to audio...".to_string(),
            )));
            actions.push(Action::Connect {
                mode: QueryMode::Audio,
                epoch: self.epoch,
            });
        }
        actions
    }

    fn on_capture_started(&mut self) -> Vec<Action> {
        if !self.starting_mic {
            // Stale start result from an aborted attempt.
            return vec![Action::StopCapture];
        }

        self.mic_ready = true;
        if self.socket_open && self.mode == QueryMode::Audio {
            self.complete_listening()
        } else {
            Vec::new()
        }
    }

    fn complete_listening(&mut self) -> Vec<Action> {
        self.is_listening = true;
        self.starting_mic = false;
        vec![
            Action::StartBatchTimer,
            Action::Emit(UiEvent::Listening(true)),
            Action::Emit(UiEvent::Status("Listening...".to_string())),
        ]
    }

    fn on_capture_failed(&mut self, reason: String) -> Vec<Action> {
        self.starting_mic = false;
        self.mic_ready = false;
        debug!("capture failed: {}", reason);
        vec![
            Action::StopCapture,
            Action::Emit(UiEvent::Status("Microphone unavailable".to_string())),
        ]
    }

    fn on_chunk(&mut self, bytes: Vec<u8>, level: f32) -> Vec<Action> {
        if !self.is_listening && !self.starting_mic {
            // Late block after stop; the device is already being released.
            return Vec::new();
        }
        self.send_buffer.extend_from_slice(&bytes);
        vec![Action::Emit(UiEvent::AudioLevel(level))]
    }

    fn on_batch_timer(&mut self) -> Vec<Action> {
        match self.flush_send_buffer() {
            Some(action) => vec![action],
            None => Vec::new(),
        }
    }

    /// Concatenate the buffered chunks into one outbound frame.
    fn flush_send_buffer(&mut self) -> Option<Action> {
        if self.send_buffer.is_empty() {
            return None;
        }
        let pcm = std::mem::take(&mut self.send_buffer);
        Some(Action::SendFrame {
            payload: audio_frame(&pcm),
        })
    }

    fn on_stop_speaking(&mut self) -> Vec<Action> {
        if !self.is_listening && !self.starting_mic {
            return Vec::new();
        }

        let mut actions = Vec::new();
        // Flush what the timer has not sent yet before the mic goes away.
        if let Some(flush) = self.flush_send_buffer() {
            actions.push(flush);
        }
        actions.push(Action::StopBatchTimer);
        actions.push(Action::StopCapture);

        self.is_listening = false;
        self.starting_mic = false;
        self.mic_ready = false;

        actions.push(Action::Emit(UiEvent::Listening(false)));
        actions.push(Action::Emit(UiEvent::AudioLevel(0.0)));
        actions.push(Action::Emit(UiEvent::Status("Connected".to_string())));
        actions
    }

    fn on_frame(&mut self, epoch: u64, frame: ServerFrame) -> Vec<Action> {
        if epoch != self.epoch {
            debug!(stale = epoch, current = self.epoch, "stale frame ignored");
            return Vec::new();
        }
        if self.terminal() {
            return Vec::new();
        }

        match frame {
            ServerFrame::AudioChunk(bytes) => vec![Action::EnqueueAudio { bytes }],
            ServerFrame::TextDelta(delta) => self.on_text_delta(delta),
            ServerFrame::Interrupted => vec![Action::FlushPlayback],
            ServerFrame::TurnComplete => self.on_turn_complete(),
        }
    }

    fn on_text_delta(&mut self, delta: String) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.open_turn {
            if let Some(message) = self.messages.last_mut() {
                message.text.push_str(&delta);
                actions.push(Action::Emit(UiEvent::MessageUpdated(message.clone())));
            }
        } else {
            let message = ConversationMessage {
                id: Uuid::new_v4().to_string(),
                sender: MessageSender::Assistant,
                text: delta,
                timestamp: Utc::now().timestamp_millis(),
            };
            self.open_turn = true;
            actions.push(Action::Emit(UiEvent::MessageAdded(message.clone())));
            self.messages.push(message);
        }

        // The farewell may be split across deltas, so test the whole
        // accumulated turn text every time.
        if !self.pending_end {
            if let Some(message) = self.messages.last() {
                if contains_farewell(&message.text) {
                    debug!(session = %self.session_id, "farewell detected, ending after this turn");
                    self.pending_end = true;
                }
            }
        }
        actions
    }

    fn on_turn_complete(&mut self) -> Vec<Action> {
        self.open_turn = false;
        if self.pending_end {
            let mut actions = vec![Action::FlushPlayback];
            actions.extend(self.begin_termination(FAREWELL_GRACE_MS));
            actions
        } else {
            Vec::new()
        }
    }

    fn on_end_call(&mut self) -> Vec<Action> {
        if self.terminal() {
            debug!("end_call ignored: already ending");
            return Vec::new();
        }
        self.begin_termination(HANGUP_GRACE_MS)
    }

    /// Shared teardown: stop the mic, close the socket, close playback, play
    /// the confirmation tone, and notify the UI after the grace delay.
    /// Reconnection is disabled before the socket closes so the drop cannot
    /// schedule a reconnect.
    fn begin_termination(&mut self, delay_ms: u64) -> Vec<Action> {
        self.status = CallStatus::Ending;
        self.reconnect_enabled = false;
        self.pending_end = false;
        self.is_listening = false;
        self.starting_mic = false;
        self.mic_ready = false;

        let mut actions = Vec::new();
        if let Some(flush) = self.flush_send_buffer() {
            actions.push(flush);
        }
        actions.push(Action::StopBatchTimer);
        actions.push(Action::StopCapture);
        actions.push(Action::CloseSocket);
        actions.push(Action::StopPlayback);
        actions.push(Action::PlayEndTone);
        actions.push(Action::Emit(UiEvent::Listening(false)));
        actions.push(Action::Emit(UiEvent::Status("Ending call...".to_string())));
        actions.push(Action::ScheduleEnd { delay_ms });
        actions
    }

    fn on_end_elapsed(&mut self) -> Vec<Action> {
        if self.status != CallStatus::Ending {
            return Vec::new();
        }
        self.status = CallStatus::Ended;
        vec![
            Action::Emit(UiEvent::Connected(false)),
            Action::Emit(UiEvent::Status("Call ended".to_string())),
            Action::Emit(UiEvent::CallEnded),
        ]
    }

    fn on_shutdown(&mut self) -> Vec<Action> {
        if self.status == CallStatus::Ended {
            return Vec::new();
        }

        self.status = CallStatus::Ended;
        self.reconnect_enabled = false;
        self.is_listening = false;
        self.starting_mic = false;

        vec![
            Action::StopBatchTimer,
            Action::StopCapture,
            Action::CloseSocket,
            Action::StopPlayback,
            Action::Emit(UiEvent::CallEnded),
        ]
    }
}
