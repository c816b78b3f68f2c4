use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::stats::ProcessorStats;

/// Prometheus metrics for daemon health and observability.
///
/// Counters mirror the processor's statistics registry; they are refreshed
/// on scrape rather than on every event so the hot path stays untouched.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    stats: Arc<ProcessorStats>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total atoms observed, valid or not.
    atoms_logged: IntCounter,
    /// Atoms rejected as malformed.
    atom_errors: IntCounter,
    /// Data-fetch broadcasts delivered.
    broadcasts_sent: IntCounter,
    /// Activation broadcasts suppressed by the per-uid rate limit.
    activation_guardrail_hits: IntCounter,
    /// Configs whose data was dropped over the memory cap.
    data_dropped: IntCounter,
    /// Configuration TTL resets.
    config_resets: IntCounter,
    /// Anomalies declared by alert thresholds.
    anomalies_declared: IntCounter,
    /// Whether the ingress reported losing events (1=yes).
    data_corrupted: IntGauge,
}

impl HealthMetrics {
    pub fn new(addr: &str, stats: Arc<ProcessorStats>) -> Result<Self> {
        let registry = Registry::new();

        let atoms_logged = IntCounter::with_opts(
            Opts::new("atoms_logged_total", "Total atoms observed.").namespace("atomsink"),
        )?;
        let atom_errors = IntCounter::with_opts(
            Opts::new("atom_errors_total", "Atoms rejected as malformed.").namespace("atomsink"),
        )?;
        let broadcasts_sent = IntCounter::with_opts(
            Opts::new("broadcasts_sent_total", "Data-fetch broadcasts delivered.")
                .namespace("atomsink"),
        )?;
        let activation_guardrail_hits = IntCounter::with_opts(
            Opts::new(
                "activation_guardrail_hits_total",
                "Activation broadcasts suppressed by the per-uid rate limit.",
            )
            .namespace("atomsink"),
        )?;
        let data_dropped = IntCounter::with_opts(
            Opts::new(
                "data_dropped_total",
                "Configs whose data was dropped over the memory cap.",
            )
            .namespace("atomsink"),
        )?;
        let config_resets = IntCounter::with_opts(
            Opts::new("config_resets_total", "Configuration TTL resets.").namespace("atomsink"),
        )?;
        let anomalies_declared = IntCounter::with_opts(
            Opts::new(
                "anomalies_declared_total",
                "Anomalies declared by alert thresholds.",
            )
            .namespace("atomsink"),
        )?;
        let data_corrupted = IntGauge::with_opts(
            Opts::new(
                "data_corrupted",
                "Whether the ingress reported losing events (1=yes).",
            )
            .namespace("atomsink"),
        )?;

        registry.register(Box::new(atoms_logged.clone()))?;
        registry.register(Box::new(atom_errors.clone()))?;
        registry.register(Box::new(broadcasts_sent.clone()))?;
        registry.register(Box::new(activation_guardrail_hits.clone()))?;
        registry.register(Box::new(data_dropped.clone()))?;
        registry.register(Box::new(config_resets.clone()))?;
        registry.register(Box::new(anomalies_declared.clone()))?;
        registry.register(Box::new(data_corrupted.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            stats,
            shutdown: parking_lot::Mutex::new(None),
            atoms_logged,
            atom_errors,
            broadcasts_sent,
            activation_guardrail_hits,
            data_dropped,
            config_resets,
            anomalies_declared,
            data_corrupted,
        })
    }

    /// Copies the statistics registry into the prometheus counters.
    fn refresh(&self) {
        set_counter(&self.atoms_logged, self.stats.atoms_logged());
        set_counter(&self.atom_errors, self.stats.atom_errors());
        set_counter(&self.broadcasts_sent, self.stats.broadcasts_sent());
        set_counter(
            &self.activation_guardrail_hits,
            self.stats.activation_guardrail_hits(),
        );
        set_counter(&self.data_dropped, self.stats.data_dropped_events());
        set_counter(&self.config_resets, self.stats.config_resets());
        set_counter(&self.anomalies_declared, self.stats.anomalies_declared());
        self.data_corrupted.set(i64::from(
            self.stats.has_event_queue_overflow() || self.stats.has_socket_loss(),
        ));
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9464"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(&self));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Advances a prometheus counter to an externally tracked total.
fn set_counter(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(metrics): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    metrics.refresh();

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_copies_stats() {
        let stats = Arc::new(ProcessorStats::new(0));
        let metrics = HealthMetrics::new(":0", Arc::clone(&stats)).expect("metrics");

        stats.note_atom_logged(100, false);
        stats.note_atom_logged(100, false);
        stats.note_atom_error(100);
        metrics.refresh();

        assert_eq!(metrics.atoms_logged.get(), 2);
        assert_eq!(metrics.atom_errors.get(), 1);
        assert_eq!(metrics.data_corrupted.get(), 0);

        stats.note_socket_loss();
        metrics.refresh();
        assert_eq!(metrics.data_corrupted.get(), 1);
    }

    #[test]
    fn test_refresh_is_monotonic() {
        let stats = Arc::new(ProcessorStats::new(0));
        let metrics = HealthMetrics::new(":0", Arc::clone(&stats)).expect("metrics");

        stats.note_atom_logged(1, false);
        metrics.refresh();
        metrics.refresh();
        assert_eq!(metrics.atoms_logged.get(), 1);
    }
}
