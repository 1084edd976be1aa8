//! # Configuration Management
//!
//! Loads relay settings from three layers, highest priority first:
//! 1. Environment variables (`RELAY__SERVER__PORT`, `RELAY__TRANSLATION__API_URL`, ...)
//!    plus the bare deployment variables `HOST`, `PORT`, `TRANSLATION_API_URL`,
//!    `TRANSLATION_JWT_SECRET` and `REDIS_URL`
//! 2. Configuration file (`config.toml`, optional)
//! 3. Built-in defaults (the `Default` impl)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: every section derives `Serialize` so the defaults can be fed
//!   back into the `config` builder, and `Deserialize` to read the merged result
//! - **Nested structs**: one struct per concern keeps call sites short
//!   (`config.audio.playback_sample_rate`)
//!
//! Env keys use a double underscore between path segments because field names
//! themselves contain single underscores.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub translation: TranslationConfig,
    pub reverse: ReverseConfig,
    pub store: StoreConfig,
    pub audio: AudioConfig,
    pub auth: AuthConfig,
}

/// HTTP server and per-client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Outbound queue slots per client; a full queue gets the client dropped
    pub client_queue_capacity: usize,

    /// WebSocket ping interval
    pub heartbeat_interval_secs: u64,

    /// Close a client that has not answered for this long
    pub client_timeout_secs: u64,
}

/// Streaming translation backend.
///
/// The relay signs a short-lived HS256 token with `jwt_secret` and passes it,
/// together with the room's language pair, as query parameters of `api_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    pub api_url: String,
    pub jwt_secret: String,
    pub token_subject: String,
    pub token_ttl_secs: u64,
    pub model: String,
    pub mute: bool,
    pub multi: bool,

    /// Wait between failed connection attempts
    pub connect_retry_ms: u64,

    /// Wait before reconnecting after an established stream broke
    pub reconnect_delay_ms: u64,
}

/// Reverse (back) translation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseConfig {
    pub api_url: String,
    pub api_key: Option<String>,

    /// How many of the latest stored messages form the context window
    pub context_window: usize,

    /// One timeout per attempt; the list length is the attempt budget
    pub attempt_timeouts_secs: Vec<u64>,

    /// Timeout for the contextless attempt after a truncated response
    pub fallback_timeout_secs: u64,

    /// Sleep before attempt `n + 1` is `retry_backoff_ms * n`
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
}

/// Audio formats on both sides of the relay. All audio is 16-bit LE mono PCM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Rate clients record at
    pub client_sample_rate: u32,

    /// Rate the backend expects for input audio
    pub backend_sample_rate: u32,

    /// Rate of the synthesized audio the backend sends back
    pub backend_audio_rate: u32,

    /// Rate clients play back at
    pub playback_sample_rate: u32,

    /// Bytes of framing in front of every backend audio frame
    pub backend_audio_header_bytes: usize,

    /// Input frames per resampler chunk
    pub resampler_chunk: usize,

    /// Client audio is held back until at least this much is buffered (0 = forward immediately)
    pub min_frame_ms: u32,

    /// Upper bound on buffered client audio before the oldest samples are dropped
    pub max_buffer_ms: u32,
}

/// WebSocket session gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    pub cookie_name: String,
    /// Sessions live under `{session_key_prefix}:{session_id}`
    pub session_key_prefix: String,
    pub redis_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                client_queue_capacity: 256,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            translation: TranslationConfig {
                api_url: "ws://127.0.0.1:9000/ws/translate".to_string(),
                jwt_secret: "change-me".to_string(),
                token_subject: "e".to_string(),
                token_ttl_secs: 3600,
                model: "ultra".to_string(),
                mute: false,
                multi: true,
                connect_retry_ms: 2000,
                reconnect_delay_ms: 2000,
            },
            reverse: ReverseConfig {
                api_url: "http://127.0.0.1:9001/reverse".to_string(),
                api_key: None,
                context_window: 6,
                attempt_timeouts_secs: vec![15, 20, 25],
                fallback_timeout_secs: 20,
                retry_backoff_ms: 1000,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                redis_url: "redis://127.0.0.1:6379".to_string(),
            },
            audio: AudioConfig {
                client_sample_rate: 16000,
                backend_sample_rate: 16000,
                backend_audio_rate: 24000,
                playback_sample_rate: 48000,
                backend_audio_header_bytes: 20,
                resampler_chunk: 480,
                min_frame_ms: 0,
                max_buffer_ms: 5000,
            },
            auth: AuthConfig {
                enabled: false,
                cookie_name: "auth_session".to_string(),
                session_key_prefix: "auth_session".to_string(),
                redis_url: "redis://127.0.0.1:6379".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("reverse.attempt_timeouts_secs")
                    .try_parsing(true),
            );

        // Deployment platforms set these without a prefix
        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("TRANSLATION_API_URL", "translation.api_url"),
            ("TRANSLATION_JWT_SECRET", "translation.jwt_secret"),
            ("REDIS_URL", "store.redis_url"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.server.client_queue_capacity == 0 {
            return Err(anyhow!("Client queue capacity must be greater than 0"));
        }

        let url = url::Url::parse(&self.translation.api_url)
            .map_err(|e| anyhow!("Invalid translation api_url: {}", e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow!("Translation api_url must use ws:// or wss://"));
        }

        if self.reverse.attempt_timeouts_secs.is_empty() {
            return Err(anyhow!("Reverse translation needs at least one attempt"));
        }

        if self.reverse.context_window == 0 {
            return Err(anyhow!("Reverse context window must be greater than 0"));
        }

        let rates = [
            self.audio.client_sample_rate,
            self.audio.backend_sample_rate,
            self.audio.backend_audio_rate,
            self.audio.playback_sample_rate,
        ];
        if rates.contains(&0) {
            return Err(anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.resampler_chunk == 0 {
            return Err(anyhow!("Resampler chunk must be greater than 0"));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err(anyhow!("Redis store selected but store.redis_url is empty"));
        }

        if self.auth.enabled && self.auth.session_key_prefix.is_empty() {
            return Err(anyhow!("Session gate enabled but auth.session_key_prefix is empty"));
        }

        Ok(())
    }

    /// Copy safe to expose over HTTP: secrets are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.translation.jwt_secret = "***".to_string();
        if copy.reverse.api_key.is_some() {
            copy.reverse.api_key = Some("***".to_string());
        }
        copy
    }
}

impl TranslationConfig {
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl ReverseConfig {
    pub fn attempt_timeouts(&self) -> Vec<Duration> {
        self.attempt_timeouts_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl AudioConfig {
    /// Bytes of 16-bit mono audio covering `ms` at `rate`.
    pub fn bytes_for(rate: u32, ms: u32) -> usize {
        (rate as usize * ms as usize / 1000) * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.client_queue_capacity, 256);
        assert_eq!(config.reverse.attempt_timeouts_secs, vec![15, 20, 25]);
        assert_eq!(config.reverse.context_window, 6);
        assert_eq!(config.audio.backend_audio_header_bytes, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.translation.api_url = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reverse.attempt_timeouts_secs.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.playback_sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = AppConfig::default();
        config.reverse.api_key = Some("secret-key".to_string());
        let redacted = config.redacted();
        assert_eq!(redacted.translation.jwt_secret, "***");
        assert_eq!(redacted.reverse.api_key.as_deref(), Some("***"));
        assert_eq!(config.translation.jwt_secret, "change-me");
    }

    #[test]
    fn test_bytes_for() {
        assert_eq!(AudioConfig::bytes_for(16000, 20), 640);
        assert_eq!(AudioConfig::bytes_for(16000, 0), 0);
    }
}
