//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Many handlers share ownership of the same config, metrics and sessions
//! - **Cleanup**: Data is freed when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Config**: Read on every new connection, written only by `PUT /api/v1/config`
//! - **Poisoning**: A panic while holding the lock poisons it; we recover the inner value
//!   with `PoisonError::into_inner` instead of panicking again
//!
//! ### Arc<RwLock<T>> Pattern
//! Thread-safe shared mutable state, cloned cheaply into every worker thread.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::session::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (updatable at runtime, new sessions pick it up)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP and session counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Every live voice session
    pub sessions: Arc<SessionRegistry>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all requests and sessions.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: Load and reliability of the HTTP API
/// - **sessions_opened / sessions_closed**: Conversation churn; the live count comes from
///   the registry
/// - **endpoint_metrics**: Per-endpoint latency
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_rejected: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the shared state. The session limit is fixed for the process lifetime.
    pub fn new(config: AppConfig) -> Self {
        let sessions = Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so a slow caller never blocks a config update.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a partial JSON update. The stored config only changes if the result validates.
    pub fn update_config(&self, updates: &str) -> AppResult<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut candidate = config.clone();
        candidate
            .update_from_json(updates)
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        *config = candidate.clone();
        Ok(candidate)
    }

    fn metrics_mut(&self) -> std::sync::RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against an endpoint.
    ///
    /// ## HashMap operations:
    /// `.entry().or_default()` creates the endpoint's metric the first time it is seen.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_opened(&self) {
        self.metrics_mut().sessions_opened += 1;
    }

    pub fn record_session_closed(&self) {
        self.metrics_mut().sessions_closed += 1;
    }

    pub fn record_session_rejected(&self) {
        self.metrics_mut().sessions_rejected += 1;
    }

    /// Copy of the current metrics, taken under a read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
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

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
