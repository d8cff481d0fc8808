//! # Configuration Management
//!
//! Loads the bridge's configuration from several sources, lowest priority
//! first:
//!
//! 1. Built-in defaults (the `Default` impl below)
//! 2. `config.toml` in the working directory, if present
//! 3. `APP_`-prefixed environment variables, with `__` between nesting
//!    levels (`APP_SERVER__PORT=9000`, `APP_AUDIO__MIX_ORIGINAL=true`)
//! 4. The plain deployment variables telephony and translation accounts are
//!    usually provisioned with (`PORT`, `TWILIO_AUTH_TOKEN`, ...)
//!
//! ## Configuration Groups:
//! - **server**: bind address plus the public host name the telephony
//!   provider uses to reach the webhooks and media websockets
//! - **telephony**: REST credentials, caller id and the operator's number
//! - **translation**: REST credentials, per-role languages and the
//!   pipeline's queue-levelling knobs
//! - **audio**: sample rates, chunk and block durations, optional mixing
//! - **pool**: worker threads per transform and batch sizing
//! - **session**: capacity and rendezvous timeouts

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub telephony: TelephonyConfig,
    pub translation: TranslationConfig,
    pub audio: AudioConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
}

/// Where the HTTP server listens and how the outside world reaches it.
///
/// `public_host` is a bare host name (no scheme). Webhook URLs are built as
/// `https://{public_host}/...` and media streams as `wss://{public_host}/...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_host: String,
}

/// Telephony provider account used to place and hang up calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: String,
    /// Number outbound calls are placed from
    pub caller_id: String,
    /// Number the operator leg is dialled at
    pub operator_number: String,
}

/// Translation service account and pipeline tuning.
///
/// ## Queue levelling:
/// The service keeps a queue of synthesized speech per session. With
/// `auto_tempo` it speeds playback up (between `min_tempo` and `max_tempo`)
/// to hold the queue near `desired_queue_level_ms`, and never lets it grow
/// beyond `max_queue_level_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    pub api_base: String,
    pub client_id: String,
    pub client_secret: String,
    /// Language spoken on the client leg
    pub client_language: String,
    /// Language spoken on the operator leg
    pub operator_language: String,
    /// Seconds of silence after which a sentence is confirmed
    pub segment_confirmation_silence: f32,
    pub desired_queue_level_ms: u32,
    pub max_queue_level_ms: u32,
    pub auto_tempo: bool,
    pub min_tempo: f32,
    pub max_tempo: f32,
    /// Receive timeout on the translation socket; a timeout just retries
    pub receive_timeout_secs: u64,
}

/// Audio formats on both sides of the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Telephony legs: mu-law, 1 byte per sample
    pub leg_sample_rate: u32,
    /// Translation service: PCM s16le, 2 bytes per sample
    pub service_sample_rate: u32,
    /// Inbound chunk handed to one `mulaw -> pcm` transform
    pub chunk_duration_ms: u32,
    /// Outbound block handed to one `pcm -> mulaw` transform
    pub block_duration_ms: u32,
    /// Mix the speaker's original audio under the translation sent to the
    /// other party
    pub mix_original: bool,
    pub original_gain: f32,
    pub translated_gain: f32,
}

/// Offload pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker threads per transform pool
    pub workers: usize,
    /// Tasks per queue item for `submit_batch`
    pub batch_size: usize,
    /// How long `close()` waits for workers to exit
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    /// How long a leg waits for its partner and for the operator to answer
    pub rendezvous_timeout_secs: u64,
    /// How long outbound audio waits for the opposite leg's stream id
    pub stream_id_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                public_host: "localhost:8080".to_string(),
            },
            telephony: TelephonyConfig {
                api_base: "https://api.twilio.com".to_string(),
                account_sid: String::new(),
                auth_token: String::new(),
                caller_id: String::new(),
                operator_number: String::new(),
            },
            translation: TranslationConfig {
                api_base: "https://api.palabra.ai".to_string(),
                client_id: String::new(),
                client_secret: String::new(),
                client_language: "en".to_string(),
                operator_language: "ru".to_string(),
                segment_confirmation_silence: 0.7,
                desired_queue_level_ms: 10_000,
                max_queue_level_ms: 24_000,
                auto_tempo: true,
                min_tempo: 1.0,
                max_tempo: 1.2,
                receive_timeout_secs: 60,
            },
            audio: AudioConfig {
                leg_sample_rate: 8000,
                service_sample_rate: 24_000,
                chunk_duration_ms: 320,
                block_duration_ms: 20,
                mix_original: false,
                original_gain: 0.3,
                translated_gain: 0.7,
            },
            pool: PoolConfig {
                workers: 2,
                batch_size: 32,
                shutdown_timeout_ms: 1000,
            },
            session: SessionConfig {
                max_concurrent_sessions: 50,
                rendezvous_timeout_secs: 120,
                stream_id_timeout_secs: 10,
            },
        }
    }
}

/// Deployment variables that map onto a config key without the `APP_` prefix.
const PLAIN_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("PUBLIC_HOST", "server.public_host"),
    ("TWILIO_ACCOUNT_SID", "telephony.account_sid"),
    ("TWILIO_AUTH_TOKEN", "telephony.auth_token"),
    ("TWILIO_NUMBER", "telephony.caller_id"),
    ("OPERATOR_NUMBER", "telephony.operator_number"),
    ("PALABRA_CLIENT_ID", "translation.client_id"),
    ("PALABRA_CLIENT_SECRET", "translation.client_secret"),
];

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SESSION__MAX_CONCURRENT_SESSIONS=10`
    /// - `APP_TRANSLATION__CLIENT_LANGUAGE=es`
    /// - `PUBLIC_HOST=bridge.example.com`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in PLAIN_ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.public_host.is_empty() || self.server.public_host.contains("://") {
            return Err(anyhow::anyhow!(
                "server.public_host must be a bare host name, got {:?}",
                self.server.public_host
            ));
        }

        if self.audio.leg_sample_rate == 0 || self.audio.service_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.chunk_duration_ms == 0 || self.audio.block_duration_ms == 0 {
            return Err(anyhow::anyhow!("Chunk and block durations must be greater than 0"));
        }

        for (name, gain) in [
            ("original_gain", self.audio.original_gain),
            ("translated_gain", self.audio.translated_gain),
        ] {
            if !gain.is_finite() || gain < 0.0 {
                return Err(anyhow::anyhow!("audio.{} must be a non-negative number", name));
            }
        }

        if self.audio.mix_original && self.audio.original_gain + self.audio.translated_gain <= 0.0 {
            return Err(anyhow::anyhow!("Mixing gains must not both be 0"));
        }

        if self.pool.workers == 0 {
            return Err(anyhow::anyhow!("Pool workers must be greater than 0"));
        }

        if self.pool.batch_size == 0 {
            return Err(anyhow::anyhow!("Pool batch size must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.translation.client_language == self.translation.operator_language {
            return Err(anyhow::anyhow!(
                "Client and operator languages must differ (both are {:?})",
                self.translation.client_language
            ));
        }

        Ok(())
    }

    /// Bytes of leg audio (mu-law, 1 byte per sample) in one inbound chunk.
    pub fn chunk_bytes(&self) -> usize {
        (self.audio.leg_sample_rate as usize * self.audio.chunk_duration_ms as usize) / 1000
    }

    /// Bytes of service audio (PCM s16le, 2 bytes per sample) in one
    /// outbound block.
    pub fn block_bytes(&self) -> usize {
        (self.audio.service_sample_rate as usize * self.audio.block_duration_ms as usize) / 1000 * 2
    }

    /// Effective configuration with credentials masked, for the config
    /// endpoint and startup logs.
    pub fn redacted(&self) -> serde_json::Value {
        let mut copy = self.clone();
        for secret in [
            &mut copy.telephony.auth_token,
            &mut copy.translation.client_secret,
        ] {
            if !secret.is_empty() {
                *secret = "********".to_string();
            }
        }
        serde_json::to_value(copy).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_sizes() {
        let config = AppConfig::default();
        // 8000 Hz × 320 ms × 1 byte
        assert_eq!(config.chunk_bytes(), 2560);
        // 24000 Hz × 20 ms × 2 bytes
        assert_eq!(config.block_bytes(), 960);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pool.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.public_host = "https://bridge.example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.mix_original = true;
        config.audio.original_gain = 0.0;
        config.audio.translated_gain = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = AppConfig::default();
        config.telephony.auth_token = "twilio-secret".to_string();
        config.translation.client_secret = "palabra-secret".to_string();

        let view = config.redacted().to_string();
        assert!(!view.contains("twilio-secret"));
        assert!(!view.contains("palabra-secret"));
        assert!(view.contains("api.twilio.com"));
    }
}
