//! # WebSocket Session Transport
//!
//! Manages the client side of the voice call's WebSocket connection.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: `{scheme}://{host}/ws/{session_id}?is_audio={bool}` plus
//!    caller identifiers as query parameters
//! 2. **Client → Server**: JSON text frames `{"mime_type": "audio/pcm",
//!    "data": "<base64 PCM16LE mono @ 16 kHz>"}`
//! 3. **Server → Client**: JSON text frames carrying either a control flag
//!    (`turn_complete`, `interrupted`) or a media payload (`audio/pcm` at
//!    24 kHz, `text/plain` transcript deltas)
//!
//! ## Epoch Guard:
//! Reconnection means several socket tasks can be alive at once for a short
//! window. Every task is created with the connection epoch current at spawn
//! time and tags every event with it; the state machine ignores events whose
//! epoch is stale. Opening a new connection replaces the outbound channel,
//! which makes the previous task send a close frame and exit.
//!
//! ## Malformed Frames:
//! A frame that cannot be parsed is logged and discarded. The connection
//! stays open; one bad frame never tears down a call.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::EndpointConfig;
use crate::error::{ClientError, ClientResult};

/// Which conversation mode a socket is opened in.
///
/// The server routes text-mode sessions to a typing interface and audio-mode
/// sessions to the speech pipeline, selected by the `is_audio` query flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Text,
    Audio,
}

impl QueryMode {
    pub fn is_audio(&self) -> bool {
        matches!(self, QueryMode::Audio)
    }
}

/// A parsed inbound frame from the agent server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// PCM16 audio chunk (already base64-decoded).
    AudioChunk(Vec<u8>),
    /// Incremental transcript text for the current assistant turn.
    TextDelta(String),
    /// The assistant finished its turn.
    TurnComplete,
    /// The assistant was interrupted; in-flight audio ends early.
    Interrupted,
}

/// Outbound media frame, serialized to a JSON text message.
#[derive(Debug, Serialize)]
struct OutboundMediaFrame<'a> {
    mime_type: &'a str,
    data: String,
}

/// Raw shape of inbound frames before classification.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    turn_complete: Option<bool>,
    #[serde(default)]
    interrupted: Option<bool>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

/// Parse one inbound text frame into a `ServerFrame`.
///
/// ## Precedence:
/// Control flags win over media payloads, matching the server's framing:
/// a frame is either a flag or a media chunk, never both.
pub fn parse_server_frame(text: &str) -> ClientResult<ServerFrame> {
    let frame: InboundFrame = serde_json::from_str(text)?;

    if frame.turn_complete == Some(true) {
        return Ok(ServerFrame::TurnComplete);
    }
    if frame.interrupted == Some(true) {
        return Ok(ServerFrame::Interrupted);
    }

    match (frame.mime_type.as_deref(), frame.data) {
        (Some("audio/pcm"), Some(data)) => Ok(ServerFrame::AudioChunk(codec::base64_to_bytes(&data)?)),
        (Some("text/plain"), Some(data)) => Ok(ServerFrame::TextDelta(data)),
        (Some(other), _) => Err(ClientError::MalformedMessage(format!(
            "unrecognized mime type: {}",
            other
        ))),
        (None, _) => Err(ClientError::MalformedMessage(
            "frame carries neither control flag nor media payload".to_string(),
        )),
    }
}

/// Serialize PCM16 bytes into an outbound audio frame.
pub fn audio_frame(pcm: &[u8]) -> String {
    let frame = OutboundMediaFrame {
        mime_type: "audio/pcm",
        data: codec::bytes_to_base64(pcm),
    };
    // Serializing a struct of strings cannot fail.
    serde_json::to_string(&frame).unwrap_or_default()
}

/// Build the session URL for the given mode.
pub fn session_url(endpoint: &EndpointConfig, session_id: &str, mode: QueryMode) -> String {
    format!(
        "{}://{}/ws/{}?is_audio={}&company_doc_id={}&founder_name={}",
        endpoint.scheme,
        endpoint.host,
        session_id,
        mode.is_audio(),
        endpoint.company_doc_id,
        endpoint.founder_name
    )
}

/// Connection lifecycle events, tagged with the epoch of the socket that
/// produced them.
#[derive(Debug)]
pub enum TransportEvent {
    Opened { epoch: u64 },
    Closed { epoch: u64 },
    Frame { epoch: u64, frame: ServerFrame },
}

/// Owns at most one live WebSocket connection for a session.
///
/// `connect` spawns a socket task; calling it again supersedes the previous
/// task. `send` and `close` act on whichever connection is current.
pub struct SessionTransport {
    endpoint: EndpointConfig,
    session_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl SessionTransport {
    pub fn new(
        endpoint: EndpointConfig,
        session_id: String,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            endpoint,
            session_id,
            events,
            outbound: Arc::new(Mutex::new(None)),
        }
    }

    /// Open a new connection in the given mode.
    ///
    /// The previous connection (if any) is superseded: its outbound channel
    /// is dropped, which makes its task send a close frame and exit. All
    /// events from the new socket carry `epoch`.
    pub fn connect(&self, mode: QueryMode, epoch: u64) {
        let url = session_url(&self.endpoint, &self.session_id, mode);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(out_tx);
        }

        let events = self.events.clone();
        info!(epoch, ?mode, "connecting session socket");

        tokio::spawn(async move {
            let ws = match connect_async(url.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    warn!(epoch, "connect failed: {}", e);
                    let _ = events.send(TransportEvent::Closed { epoch });
                    return;
                }
            };

            let (mut sink, mut stream) = ws.split();
            let _ = events.send(TransportEvent::Opened { epoch });

            loop {
                tokio::select! {
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => match parse_server_frame(&text) {
                            Ok(frame) => {
                                let _ = events.send(TransportEvent::Frame { epoch, frame });
                            }
                            Err(e) => {
                                // Discard and keep the connection alive.
                                warn!(epoch, "discarding inbound frame: {}", e);
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                        Some(Err(e)) => {
                            warn!(epoch, "socket read error: {}", e);
                            break;
                        }
                    },
                    outbound = out_rx.recv() => match outbound {
                        Some(payload) => {
                            if let Err(e) = sink.send(Message::Text(payload)).await {
                                warn!(epoch, "socket send error: {}", e);
                                break;
                            }
                        }
                        // Superseded or closed locally: say goodbye and exit.
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                }
            }

            debug!(epoch, "socket task finished");
            let _ = events.send(TransportEvent::Closed { epoch });
        });
    }

    /// Send a text payload on the current connection. No-op when no
    /// connection is open.
    pub fn send(&self, payload: String) {
        if let Ok(slot) = self.outbound.lock() {
            if let Some(tx) = slot.as_ref() {
                let _ = tx.send(payload);
            } else {
                debug!("send with no open socket ignored");
            }
        }
    }

    /// Close the current connection. Safe to call repeatedly.
    pub fn close(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            scheme: "wss".to_string(),
            host: "agent.example.com".to_string(),
            company_doc_id: "doc-42".to_string(),
            founder_name: "Ada".to_string(),
        }
    }

    #[test]
    fn test_session_url() {
        let url = session_url(&endpoint(), "abc123", QueryMode::Audio);
        assert_eq!(
            url,
            "wss://agent.example.com/ws/abc123?is_audio=true&company_doc_id=doc-42&founder_name=Ada"
        );

        let url = session_url(&endpoint(), "abc123", QueryMode::Text);
        assert!(url.contains("is_audio=false"));
    }

    #[test]
    fn test_parse_turn_complete() {
        let frame = parse_server_frame(r#"{"turn_complete": true}"#).unwrap();
        assert_eq!(frame, ServerFrame::TurnComplete);
    }

    #[test]
    fn test_parse_interrupted() {
        let frame = parse_server_frame(r#"{"interrupted": true}"#).unwrap();
        assert_eq!(frame, ServerFrame::Interrupted);
    }

    #[test]
    fn test_parse_text_delta() {
        let frame = parse_server_frame(r#"{"mime_type": "text/plain", "data": "hello"}"#).unwrap();
        assert_eq!(frame, ServerFrame::TextDelta("hello".to_string()));
    }

    #[test]
    fn test_parse_audio_chunk() {
        // Two PCM16 samples: 0x0100 and 0x0302.
        let payload = codec::bytes_to_base64(&[0, 1, 2, 3]);
        let raw = format!(r#"{{"mime_type": "audio/pcm", "data": "{}"}}"#, payload);
        let frame = parse_server_frame(&raw).unwrap();
        assert_eq!(frame, ServerFrame::AudioChunk(vec![0, 1, 2, 3]));
    }

    #[test]
    fn test_parse_malformed_frames() {
        assert!(parse_server_frame("not json").is_err());
        assert!(parse_server_frame(r#"{"mime_type": "video/mp4", "data": "x"}"#).is_err());
        assert!(parse_server_frame(r#"{"unrelated": 1}"#).is_err());
        assert!(parse_server_frame(r#"{"mime_type": "audio/pcm", "data": "!!"}"#).is_err());
    }

    #[test]
    fn test_audio_frame_shape() {
        let frame = audio_frame(&[0u8, 1, 2, 3]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["mime_type"], "audio/pcm");
        assert_eq!(value["data"], codec::bytes_to_base64(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_round_trip_outbound_frame_parses_as_audio() {
        // What we send is shaped like what we receive, so the parser should
        // accept our own frames.
        let frame = audio_frame(&[10u8, 20, 30, 40]);
        let parsed = parse_server_frame(&frame).unwrap();
        assert_eq!(parsed, ServerFrame::AudioChunk(vec![10, 20, 30, 40]));
    }
}
