//! Prometheus-style exporter: plain-text `/metrics`, JSON `/health`.
//!
//! Gauges, counters and named heartbeats behind one lock; the HTTP side is
//! read-only and served by its own task. Consumed by operators, not by the
//! core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use crate::now_ts;

#[derive(Debug, Default)]
struct MetricsStore {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, f64>,
    heartbeats: HashMap<String, f64>,
}

#[derive(Clone)]
pub struct Telemetry {
    enabled: bool,
    port: u16,
    store: Arc<Mutex<MetricsStore>>,
}

impl Telemetry {
    pub fn new(enabled: bool, port: u16) -> Self {
        Self { enabled, port, store: Arc::new(Mutex::new(MetricsStore::default())) }
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.store.lock().unwrap().gauges.insert(name.to_string(), value);
    }

    pub fn inc_counter(&self, name: &str, inc: f64) {
        let mut store = self.store.lock().unwrap();
        *store.counters.entry(name.to_string()).or_insert(0.0) += inc;
    }

    /// Record "component X is alive now" for the watchdogs.
    pub fn touch(&self, name: &str) {
        self.store
            .lock()
            .unwrap()
            .heartbeats
            .insert(name.to_string(), now_ts());
    }

    pub fn heartbeat_age(&self, name: &str) -> Option<f64> {
        let last = *self.store.lock().unwrap().heartbeats.get(name)?;
        Some((now_ts() - last).max(0.0))
    }

    /// Bind and serve until the process exits. No-op when disabled.
    pub async fn serve(self) {
        if !self.enabled {
            info!("[telemetry] disabled");
            return;
        }
        let addr = format!("0.0.0.0:{}", self.port);
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.store.clone());
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("[telemetry] started on port {}", self.port);
                if let Err(err) = axum::serve(listener, app).await {
                    warn!("[telemetry] server exited: {err}");
                }
            }
            Err(err) => warn!("[telemetry] bind {addr} failed: {err}"),
        }
    }
}

async fn metrics_handler(State(store): State<Arc<Mutex<MetricsStore>>>) -> impl IntoResponse {
    let now = now_ts();
    let body = {
        let store = store.lock().unwrap();
        let mut lines = Vec::new();
        for (k, v) in &store.gauges {
            lines.push(format!("# TYPE {k} gauge"));
            lines.push(format!("{k} {v}"));
        }
        for (k, v) in &store.counters {
            lines.push(format!("# TYPE {k} counter"));
            lines.push(format!("{k} {v}"));
        }
        for (k, ts) in &store.heartbeats {
            let age = (now - ts).max(0.0);
            lines.push(format!("# TYPE {k}_last gauge"));
            lines.push(format!("{k}_last {ts}"));
            lines.push(format!("# TYPE {k}_age_seconds gauge"));
            lines.push(format!("{k}_age_seconds {age}"));
        }
        lines.join("\n") + "\n"
    };
    ([("content-type", "text/plain; version=0.0.4")], body)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    ws_age_seconds: f64,
    quote_age_seconds: f64,
    timestamp: f64,
}

async fn health_handler(State(store): State<Arc<Mutex<MetricsStore>>>) -> impl IntoResponse {
    const NEVER: f64 = 999_999.0;
    let now = now_ts();
    let (ws_age, quote_age) = {
        let store = store.lock().unwrap();
        let age = |name: &str| {
            store
                .heartbeats
                .get(name)
                .map(|ts| (now - ts).max(0.0))
                .unwrap_or(NEVER)
        };
        (age("ws"), age("quote"))
    };
    let healthy = ws_age < 60.0 || quote_age < 60.0;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = HealthBody {
        status: if healthy { "healthy" } else { "unhealthy" },
        ws_age_seconds: (ws_age * 100.0).round() / 100.0,
        quote_age_seconds: (quote_age * 100.0).round() / 100.0,
        timestamp: now,
    };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_and_counter_updates() {
        let telemetry = Telemetry::new(false, 0);
        telemetry.set_gauge("mid", 100.5);
        telemetry.set_gauge("mid", 101.0);
        telemetry.inc_counter("frames", 1.0);
        telemetry.inc_counter("frames", 2.0);
        let store = telemetry.store.lock().unwrap();
        assert_eq!(store.gauges["mid"], 101.0);
        assert_eq!(store.counters["frames"], 3.0);
    }

    #[test]
    fn test_heartbeat_age() {
        let telemetry = Telemetry::new(false, 0);
        assert!(telemetry.heartbeat_age("ws").is_none());
        telemetry.touch("ws");
        let age = telemetry.heartbeat_age("ws").unwrap();
        assert!(age < 1.0);
    }
}
