//! # Health Endpoints
//!
//! `GET /health` (and `/api/v1/health`) reports whether the bridge can take
//! calls, plus what it is doing right now: live sessions by state, offload
//! pool counters, transcript observers and process memory.
//!
//! ## Status:
//! - **healthy**: pools open, session capacity below 90%
//! - **degraded**: session capacity at or above 90%
//! - **unhealthy**: an offload pool is closed (shutdown in progress)

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::AppState;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.sessions.summary();
    let pools = state.pools.stats_by_name();
    let status = overall_status(sessions.active, sessions.capacity, pools.values().any(|p| p.closed));

    let body = json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port,
            "public_host": state.config.server.public_host
        },
        "calls": state.metrics.snapshot(),
        "sessions": sessions,
        "pools": pools,
        "transcripts": {
            "observers": state.transcripts.observer_count(),
            "delivered": state.transcripts.delivered_count(),
            "dropped": state.transcripts.dropped_count()
        },
        "memory": memory_info()
    });

    if status == "unhealthy" {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

fn overall_status(active: usize, capacity: usize, pool_closed: bool) -> &'static str {
    if pool_closed {
        return "unhealthy";
    }
    let usage = if capacity > 0 {
        active as f64 / capacity as f64
    } else {
        1.0
    };
    if usage >= 0.9 {
        "degraded"
    } else {
        "healthy"
    }
}

#[cfg(target_os = "linux")]
fn memory_info() -> serde_json::Value {
    let status = match std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
        Ok(status) => status,
        Err(_) => return json!({ "available": false }),
    };

    let field = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };

    json!({
        "resident_memory_bytes": field("VmRSS:"),
        "virtual_memory_bytes": field("VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn memory_info() -> serde_json::Value {
    json!({ "available": false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test as actix_test, App};

    #[test]
    fn test_overall_status() {
        assert_eq!(overall_status(0, 50, false), "healthy");
        assert_eq!(overall_status(45, 50, false), "degraded");
        assert_eq!(overall_status(1, 50, true), "unhealthy");
        assert_eq!(overall_status(0, 0, false), "degraded");
    }

    #[actix_web::test]
    async fn test_health_reports_sessions_and_pools() {
        let mut config = AppConfig::default();
        config.pool.workers = 1;
        let state = web::Data::new(AppState::new(config).unwrap());
        state.sessions.create("+1555", "+1666").unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["sessions"]["by_state"]["pending"], 1);
        assert_eq!(body["pools"].as_object().unwrap().len(), 3);
        assert_eq!(body["pools"]["mulaw-to-pcm"]["workers"], 1);
        assert_eq!(body["pools"]["mixer"]["closed"], false);
        assert_eq!(body["transcripts"]["observers"], 0);
    }
}
