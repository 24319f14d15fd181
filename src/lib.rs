//! # Founder Voice Client
//!
//! An embeddable, client-side session manager for real-time voice
//! conversations with an AI startup risk-assessor agent. The crate owns
//! everything between the user's audio devices and the agent's WebSocket
//! endpoint; the embedding UI just sends intents and renders `UiEvent`s.
//!
//! ## Application Architecture:
//! - **config**: endpoint and audio configuration (TOML files + environment variables)
//! - **error**: custom error types shared across the crate
//! - **codec**: PCM16 ⇄ f32 ⇄ base64 conversions
//! - **audio**: capture and playback pipelines plus cpal device backends
//! - **websocket**: wire frames and the epoch-guarded session transport
//! - **session**: the call state machine and its async driver
//!
//! ## Usage:
//! ```rust,ignore
//! use founder_voice_client::{CallSession, ClientConfig};
//!
//! let config = ClientConfig::load()?;
//! let session_id = founder_voice_client::generate_session_id();
//! let (session, mut ui_events) = CallSession::start(config, session_id);
//! session.start_call();
//! while let Some(event) = ui_events.recv().await {
//!     // render status, transcript, audio level, ...
//! }
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod session;
pub mod websocket;

pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use session::call::generate_session_id;
pub use session::{
    AudioDevices, CallSession, CallStatus, ConversationMessage, MessageSender, UiEvent,
};
pub use websocket::{QueryMode, ServerFrame};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for binaries and examples embedding the client.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g., "debug",
///   "founder_voice_client=debug"). Defaults to info for this crate.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "founder_voice_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
