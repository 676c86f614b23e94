//! # Configuration Management
//!
//! Loads the relay configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix, using `__` to descend into
//!   sections (`APP_ENGINE__COMMAND=python3`, `APP_RELAY__REQUIRE_TOKEN=false`)
//! - `HOST` / `PORT`, which deployment platforms commonly set directly
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Complete application configuration.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket listener binds
/// - **engine**: how the per-session speech engine subprocess is launched
/// - **relay**: connection admission, heartbeats and session lifetime policy
/// - **audio**: wire formats shared with the client pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub relay: RelayConfig,
    pub audio: AudioConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How the speech engine subprocess is started.
///
/// ## Fields:
/// - `command` / `args`: the executable and its arguments (one process per session)
/// - `working_dir`: optional directory the engine runs in
/// - `region`: exported as `AWS_REGION` / `AWS_DEFAULT_REGION`
/// - `transport_url`: exported as `SOCKET_URL` when set
/// - `default_voice_id`: used when `start-voice` carries no voice id
/// - `ready_sentinel`: substring that marks the engine as ready to take audio
/// - `env_passthrough`: names of relay environment variables copied into the
///   engine environment (credential references the engine genuinely needs)
/// - `stdin_queue_capacity`: frames buffered towards the engine before new
///   ones are dropped
/// - `max_line_bytes`: longest stdout line the frame codec will hold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    pub region: String,
    #[serde(default)]
    pub transport_url: Option<String>,
    pub default_voice_id: String,
    pub ready_sentinel: String,
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    pub stdin_queue_capacity: usize,
    pub max_line_bytes: usize,
}

/// Per-connection relay policy.
///
/// `detached_idle_timeout_secs` is unset by default: a session whose client
/// disconnected keeps its engine until an explicit stop or the engine exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub require_token: bool,
    #[serde(default)]
    pub detached_idle_timeout_secs: Option<u64>,
}

/// Audio formats on both directions of the pipeline.
///
/// ## Common values:
/// - `input_sample_rate = 16000`: microphone audio sent to the engine
/// - `output_sample_rate = 24000`: synthesized speech coming back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub capture_chunk_samples: usize,
    pub playback_flush_delay_ms: u64,
    pub playback_min_chunks: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            engine: EngineConfig {
                command: "python3".to_string(),
                args: vec!["nova_boto3.py".to_string()],
                working_dir: None,
                region: "us-east-1".to_string(),
                transport_url: None,
                default_voice_id: "tiffany".to_string(),
                ready_sentinel: "ready".to_string(),
                env_passthrough: vec![
                    "AWS_ACCESS_KEY_ID".to_string(),
                    "AWS_SECRET_ACCESS_KEY".to_string(),
                    "AWS_SESSION_TOKEN".to_string(),
                    "AWS_PROFILE".to_string(),
                ],
                stdin_queue_capacity: 64,
                max_line_bytes: 4 * 1024 * 1024,
            },
            relay: RelayConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                require_token: true,
                detached_idle_timeout_secs: None,
            },
            audio: AudioConfig {
                input_sample_rate: 16000,
                output_sample_rate: 24000,
                channels: 1,
                bit_depth: 16,
                capture_chunk_samples: 1024,
                playback_flush_delay_ms: 120,
                playback_min_chunks: 4,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`
    /// - `APP_ENGINE__COMMAND=/opt/engine/bin/run`
    /// - `APP_RELAY__DETACHED_IDLE_TIMEOUT_SECS=600`
    /// - `PORT=8080`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.engine.command.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine command must not be empty"));
        }

        if self.engine.ready_sentinel.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine ready sentinel must not be empty"));
        }

        if self.engine.stdin_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Engine stdin queue capacity must be greater than 0"));
        }

        if self.engine.max_line_bytes < 1024 {
            return Err(anyhow::anyhow!("Engine max line size must be at least 1024 bytes"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.relay.detached_idle_timeout_secs == Some(0) {
            return Err(anyhow::anyhow!("Detached idle timeout must be greater than 0 when set"));
        }

        if self.audio.channels != 1 || self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Only mono 16-bit PCM audio is supported"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_chunk_samples == 0 || self.audio.playback_min_chunks == 0 {
            return Err(anyhow::anyhow!("Capture chunk size and playback threshold must be greater than 0"));
        }

        Ok(())
    }
}
