//! # Error Handling
//!
//! This module defines the error types used throughout the voice client and
//! how errors from third-party crates are converted into them.
//!
//! ## Error Philosophy:
//! Nothing in this crate is fatal to the host application. Errors surface as
//! `Result` values at the public seams; inside the session driver they become
//! status transitions (for example, a dropped socket becomes a reconnect
//! cycle) or a logged discard (a malformed server frame).
//!
//! ## Error Categories:
//! - **DeviceUnavailable**: microphone or speaker could not be acquired
//! - **Transport**: WebSocket connect/send/close failures
//! - **MalformedMessage**: an inbound frame that could not be understood
//! - **PlaybackInit**: playback chain setup failed (triggers native-rate fallback)
//! - **Config**: configuration loading or validation problems
//! - **Internal**: everything else (bugs, exhausted resources)

use std::fmt;

/// Custom error types for the voice client.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(ClientError::DeviceUnavailable("no default input device".to_string()));
/// ```
#[derive(Debug)]
pub enum ClientError {
    /// Microphone or speaker could not be opened (missing device, denied
    /// permission, exclusive use by another process).
    DeviceUnavailable(String),

    /// WebSocket-level failures: connect refused, send on a dead socket,
    /// protocol errors.
    Transport(String),

    /// An inbound server frame that is not valid JSON, not a recognized
    /// shape, or carries undecodable base64 audio.
    MalformedMessage(String),

    /// The playback chain could not be set up as requested. The pipeline
    /// falls back to the device's native rate rather than dropping audio.
    PlaybackInit(String),

    /// Configuration file or environment variable problems.
    Config(String),

    /// Internal errors that indicate a bug or an exhausted resource.
    Internal(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            ClientError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ClientError::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            ClientError::PlaybackInit(msg) => write!(f, "Playback initialization failed: {}", msg),
            ClientError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ClientError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// Automatic conversion from anyhow::Error.
///
/// ## Purpose:
/// Lets code that composes several fallible steps with `anyhow::Context`
/// bubble up through the crate's own error type with `?`.
impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Internal(err.to_string())
    }
}

/// JSON parsing failures come from server frames, so they map to
/// `MalformedMessage` rather than an internal error.
impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::MalformedMessage(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

/// WebSocket library errors are transport errors by definition.
impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// Base64 decoding failures only occur on inbound audio payloads.
impl From<base64::DecodeError> for ClientError {
    fn from(err: base64::DecodeError) -> Self {
        ClientError::MalformedMessage(format!("base64 decoding error: {}", err))
    }
}

/// Type alias for Results that use the client error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// fn load_config() -> ClientResult<ClientConfig> {
///     ClientConfig::load()
/// }
/// ```
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = ClientError::DeviceUnavailable("permission denied".to_string());
        assert_eq!(
            err.to_string(),
            "Audio device unavailable: permission denied"
        );

        let err = ClientError::Transport("connection refused".to_string());
        assert!(err.to_string().starts_with("Transport error"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ClientError = parse_err.into();
        assert!(matches!(err, ClientError::MalformedMessage(_)));
    }
}
