//! # Application State Management
//!
//! Everything an HTTP handler or WebSocket session needs is reachable from
//! one `AppState`, which actix hands to every request as `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every worker thread of the HTTP server gets its own clone of `AppState`;
//!   the clones share the same registry, monitor and metrics through `Arc`
//!
//! ### parking_lot::RwLock
//! - Request metrics are updated by the middleware on every request and read
//!   by the metrics endpoint. `parking_lot` locks cannot be poisoned, so there
//!   is no `Result` to unwrap
//! - Guards are never held across an `.await`
//!
//! ### Arc<dyn Trait>
//! - The session gate is chosen at startup (open or Redis-backed) and used
//!   through the `SessionGate` trait

use crate::auth::SessionGate;
use crate::config::AppConfig;
use crate::monitor::Monitor;
use crate::room::RoomRegistry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed after startup
    pub config: Arc<AppConfig>,

    /// HTTP request counters, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Every live room, created on first join
    pub registry: Arc<RoomRegistry>,

    /// Room, connection and task bookkeeping for the system endpoints
    pub monitor: Arc<Monitor>,

    /// Decides whether a WebSocket upgrade may proceed
    pub gate: Arc<dyn SessionGate>,

    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
///
/// - **request_count**: total requests processed
/// - **error_count**: responses with a 4xx or 5xx status
/// - **active_sessions**: WebSocket clients currently attached to a room
/// - **endpoint_metrics**: per-route statistics, keyed by `"GET /system/room-status/{room_id}"`
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Cumulative processing time (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<RoomRegistry>,
        monitor: Arc<Monitor>,
        gate: Arc<dyn SessionGate>,
    ) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            monitor,
            gate,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record one request against its route pattern.
    ///
    /// The first request to a route creates its entry with `or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_sessions(&self) {
        self.metrics.write().active_sessions += 1;
    }

    /// Saturates at zero, so an extra decrement cannot wrap the counter.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    /// A copy of the current metrics. The lock is released before the
    /// caller starts serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Share of failed requests, between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::OpenGate;
    use crate::room::RelayContext;
    use crate::store::MemoryMessageStore;
    use crate::test_support::FixedTranslator;

    pub(crate) fn test_state() -> AppState {
        let config = Arc::new(AppConfig::default());
        let monitor = Monitor::new();
        let ctx = RelayContext {
            config: Arc::clone(&config),
            store: Arc::new(MemoryMessageStore::new()),
            translator: Arc::new(FixedTranslator("Hola")),
            monitor: Arc::clone(&monitor),
        };
        AppState::new(
            config,
            Arc::new(RoomRegistry::new(ctx)),
            monitor,
            Arc::new(OpenGate),
        )
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_active_sessions_never_underflow() {
        let state = test_state();
        state.decrement_active_sessions();
        state.increment_active_sessions();
        state.increment_active_sessions();
        state.decrement_active_sessions();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }
}
