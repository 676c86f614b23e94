use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Current configuration. Pass-through variable names are listed, their
/// values never are.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "engine": {
                "command": config.engine.command,
                "args": config.engine.args,
                "region": config.engine.region,
                "transport_url": config.engine.transport_url,
                "default_voice_id": config.engine.default_voice_id,
                "env_passthrough": config.engine.env_passthrough,
                "stdin_queue_capacity": config.engine.stdin_queue_capacity,
                "max_line_bytes": config.engine.max_line_bytes
            },
            "relay": {
                "max_concurrent_sessions": config.relay.max_concurrent_sessions,
                "heartbeat_interval_secs": config.relay.heartbeat_interval_secs,
                "client_timeout_secs": config.relay.client_timeout_secs,
                "require_token": config.relay.require_token,
                "detached_idle_timeout_secs": config.relay.detached_idle_timeout_secs
            },
            "audio": {
                "input_sample_rate": config.audio.input_sample_rate,
                "output_sample_rate": config.audio.output_sample_rate,
                "channels": config.audio.channels,
                "bit_depth": config.audio.bit_depth,
                "capture_chunk_samples": config.audio.capture_chunk_samples,
                "playback_flush_delay_ms": config.audio.playback_flush_delay_ms,
                "playback_min_chunks": config.audio.playback_min_chunks
            }
        }
    }))
}
