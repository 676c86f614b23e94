use crate::config::AppConfig;
use crate::state::{AppState, MetricsSnapshot};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "relay": {
            "active_connections": metrics.connections_active,
            "live_engines": metrics.engines_live,
            "parked_sessions": state.sessions.len(),
            "frames_dropped": metrics.frames_dropped()
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "connections": {
            "opened": metrics.connections_opened,
            "active": metrics.connections_active
        },
        "engines": {
            "spawned": metrics.engines_spawned,
            "exited": metrics.engines_exited,
            "live": metrics.engines_live,
            "spawn_failures": metrics.spawn_failures
        },
        "frames": {
            "forwarded": metrics.frames_forwarded,
            "to_client": metrics.frames_to_client,
            "dropped_not_ready": metrics.frames_dropped_not_ready,
            "dropped_backpressure": metrics.frames_dropped_backpressure,
            "dropped_closed": metrics.frames_dropped_closed,
            "frames_per_second": if uptime_seconds > 0 {
                metrics.frames_forwarded as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "sessions": {
            "parked": state.sessions.len(),
            "parked_total": metrics.sessions_parked,
            "rebound": metrics.sessions_rebound,
            "reaped": metrics.sessions_reaped
        },
        "memory": get_memory_info(),
        "limits": {
            "max_concurrent_sessions": config.relay.max_concurrent_sessions,
            "stdin_queue_capacity": config.engine.stdin_queue_capacity
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "pid": process::id()
    })
}

fn get_system_status(config: &AppConfig, metrics: &MetricsSnapshot) -> serde_json::Value {
    let max = config.relay.max_concurrent_sessions;
    let engine_usage = if max > 0 {
        metrics.engines_live as f64 / max as f64
    } else {
        0.0
    };

    let status = if engine_usage >= 1.0 {
        "at_capacity"
    } else if engine_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "engine_usage_percent": (engine_usage * 100.0).round(),
        "max_engines": max,
        "current_engines": metrics.engines_live,
        "load_warnings": if engine_usage > 0.8 {
            vec!["Engine usage high - consider increasing relay.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayMetrics;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_relay_counters() {
        let state = AppState::new(AppConfig::default());
        RelayMetrics::incr(&state.metrics.engines_live);
        RelayMetrics::incr(&state.metrics.frames_dropped_not_ready);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["relay"]["live_engines"], 1);
        assert_eq!(body["relay"]["frames_dropped"], 1);
        assert_eq!(body["system"]["status"], "normal");

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/metrics").to_request()).await;
        assert_eq!(body["frames"]["dropped_not_ready"], 1);
        assert_eq!(body["limits"]["max_concurrent_sessions"], 10);
    }

    #[::core::prelude::v1::test]
    fn test_system_status_at_capacity() {
        let mut config = AppConfig::default();
        config.relay.max_concurrent_sessions = 2;
        let metrics = MetricsSnapshot {
            engines_live: 2,
            ..Default::default()
        };
        assert_eq!(get_system_status(&config, &metrics)["status"], "at_capacity");
    }
}
