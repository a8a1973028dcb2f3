//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus a compact view of
//!   sessions, models and the result cache
//! - `GET /api/v1/metrics`: HTTP endpoint metrics, pipeline counters summed
//!   over every session, registry and cache counters

use crate::config::AppConfig;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let registry = state.services().registry.summary();
    let cache = state.services().cache.stats();
    let active_sessions = state.sessions.active_session_count();

    // Standing model failures degrade the service but do not take it down.
    let status = if registry.unavailable_models > 0 {
        "degraded"
    } else {
        "healthy"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "active_sessions": active_sessions
        },
        "memory": get_memory_info(),
        "models": {
            "resident": registry.resident_models,
            "loading": registry.loading_models,
            "unavailable": registry.unavailable_models,
            "memory_usage_bytes": registry.total_memory_usage_bytes,
            "memory_limit_bytes": registry.memory_limit_bytes
        },
        "cache": {
            "entries": cache.entries,
            "capacity": cache.capacity,
            "hit_rate": cache.hit_rate
        },
        "system": get_system_status(&config, active_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "max_duration_ms": metric.max_duration_ms,
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let mut pipeline = state.sessions.pipeline_totals();
    pipeline.merge(&state.text_pipeline.stats());

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "active_sessions": state.sessions.active_session_count(),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "endpoints": endpoint_stats,
        "pipeline": pipeline,
        "models": state.services().registry.summary(),
        "cache": state.services().cache.stats(),
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "max_frame_bytes": config.performance.max_frame_bytes,
            "stage_workers": config.stage_workers(),
            "model_memory_budget_mb": config.models.memory_budget_mb
        }
    }))
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> serde_json::Value {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return json!({ "available": false });
    };

    let field_bytes = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };

    json!({
        "resident_memory_bytes": field_bytes("VmRSS:"),
        "virtual_memory_bytes": field_bytes("VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> serde_json::Value {
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(config: &AppConfig, active_sessions: usize) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    let warnings: Vec<&str> = if session_usage > 0.8 {
        vec!["High session usage - consider increasing max_concurrent_sessions"]
    } else {
        Vec::new()
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": warnings
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_status_levels() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 10;

        assert_eq!(get_system_status(&config, 2)["status"], "normal");
        assert_eq!(get_system_status(&config, 8)["status"], "moderate_load");

        let busy = get_system_status(&config, 10);
        assert_eq!(busy["status"], "high_load");
        assert_eq!(busy["session_usage_percent"], 100.0);
        assert_eq!(busy["load_warnings"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_ratio_handles_zero() {
        assert_eq!(ratio(3, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
