//! # Configuration Management
//!
//! This module handles loading and managing the voice client configuration
//! from multiple sources:
//! - TOML configuration files (voice.toml)
//! - Environment variables (with VOICE_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (VOICE_ENDPOINT_HOST, VOICE_AUDIO_CAPTURE_RATE, ...)
//! 2. Configuration file (voice.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## What is configurable and what is not:
//! The endpoint (scheme, host, caller identifiers) and the audio rates are
//! configuration. The protocol timing constants (200 ms capture batching,
//! 3000 ms reconnect delay, 600/500 ms end-of-call grace delays) are part of
//! the wire contract with the agent server and live as constants in the
//! session module instead.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main client configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (endpoint, audio) keeps each
/// concern readable and mirrors the TOML section layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub endpoint: EndpointConfig,
    pub audio: AudioConfig,
}

/// Where and how to reach the agent server.
///
/// ## Fields:
/// - `scheme`: "ws" for plain connections, "wss" for TLS
/// - `host`: hostname (and optional port) of the agent server
/// - `company_doc_id`: identifier of the company document under discussion,
///   forwarded as a query parameter so the agent can load its context
/// - `founder_name`: display name of the caller, forwarded the same way
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub scheme: String,
    pub host: String,
    pub company_doc_id: String,
    pub founder_name: String,
}

/// Audio pipeline rates.
///
/// ## Fields:
/// - `capture_rate`: sample rate audio is captured and sent at (Hz). The
///   agent expects 16 kHz mono PCM16.
/// - `playback_rate`: nominal sample rate of audio the agent sends back (Hz).
///   The agent speaks at 24 kHz; the playback pipeline resamples to whatever
///   the output device actually runs at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_rate: u32,
    pub playback_rate: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig {
                scheme: "wss".to_string(),
                host: "localhost:8000".to_string(),
                company_doc_id: String::new(),
                founder_name: String::new(),
            },
            audio: AudioConfig {
                capture_rate: 16000,  // what the agent's speech recognizer expects
                playback_rate: 24000, // what the agent's speech synthesizer produces
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from voice.toml (if it exists)
    /// 3. Override with environment variables prefixed with VOICE_
    /// 4. Handle the bare HOST variable used by deployment platforms
    ///
    /// ## Environment Variable Examples:
    /// - `VOICE_ENDPOINT_HOST=agent.example.com`: override server host
    /// - `VOICE_ENDPOINT_SCHEME=ws`: plain WebSocket for local development
    /// - `HOST=agent.example.com`: deployment-platform shorthand
    pub fn load() -> Result<Self> {
        // Load .env if present so local development can keep credentials
        // out of the shell profile. Missing files are fine.
        let _ = dotenv::dotenv();

        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default())?)
            .add_source(config::File::with_name("voice").required(false))
            .add_source(config::Environment::with_prefix("VOICE").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("endpoint.host", host)?;
        }

        let config: ClientConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Scheme is one of "ws" / "wss"
    /// - Host is not empty
    /// - Audio rates are non-zero
    ///
    /// ## Why validate:
    /// Catching configuration errors at load time produces one clear message
    /// instead of a confusing connect failure mid-call.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.scheme != "ws" && self.endpoint.scheme != "wss" {
            return Err(anyhow::anyhow!(
                "Endpoint scheme must be \"ws\" or \"wss\", got {:?}",
                self.endpoint.scheme
            ));
        }

        if self.endpoint.host.is_empty() {
            return Err(anyhow::anyhow!("Endpoint host cannot be empty"));
        }

        if self.audio.capture_rate == 0 {
            return Err(anyhow::anyhow!("Capture rate cannot be 0"));
        }

        if self.audio.playback_rate == 0 {
            return Err(anyhow::anyhow!("Playback rate cannot be 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint.scheme, "wss");
        assert_eq!(config.audio.capture_rate, 16000);
        assert_eq!(config.audio.playback_rate, 24000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();
        config.endpoint.scheme = "http".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.audio.capture_rate = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.endpoint.host = String::new();
        assert!(config.validate().is_err());
    }
}
