use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::conntrack::stats::EventStatsSnapshot;

const NAMESPACE: &str = "conntrack_accounting";

/// Prometheus metrics for the accounting agent.
///
/// All metrics use the "conntrack_accounting" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Events ===
    /// Events received from the flow source by event_type.
    pub events_received: CounterVec,
    /// Events that passed the flow filter.
    pub events_interesting: Counter,
    /// Event lines that could not be parsed.
    pub event_parse_errors: Counter,

    // === Dumps ===
    pub dumps_total: Counter,
    pub dump_failures: Counter,
    /// Time to fetch one dump, including retries.
    pub dump_duration: Histogram,
    /// Flows in the most recent dump.
    pub dump_flows: Gauge,
    /// Connections seeded from dumps.
    pub dump_seeded: Counter,
    /// Records dropped because their entry vanished from a dump.
    pub dump_evicted: Counter,

    // === Accounting ===
    pub connections_tracked: Gauge,
    pub intervals_flushed: Counter,
    pub entries_flushed: Counter,
    /// Flush duration (100us-1s buckets).
    pub flush_duration: Histogram,

    // === Ports ===
    /// Port-file reloads by status (applied/rejected).
    pub port_reloads: CounterVec,
    pub port_entries: Gauge,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = CounterVec::new(
            Opts::new(
                "events_received_total",
                "Flow events received from the source by event type.",
            )
            .namespace(NAMESPACE),
            &["event_type"],
        )?;
        let events_interesting = counter(
            "events_interesting_total",
            "Flow events accepted by the flow filter.",
        )?;
        let event_parse_errors = counter(
            "event_parse_errors_total",
            "Event lines that could not be parsed.",
        )?;

        let dumps_total = counter("dumps_total", "Completed flow table dumps.")?;
        let dump_failures = counter(
            "dump_failures_total",
            "Flow table dump attempts that failed.",
        )?;
        let dump_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dump_duration_seconds",
                "Time to fetch a flow table dump, including retries.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let dump_flows = gauge("dump_flows", "Flows contained in the most recent dump.")?;
        let dump_seeded = counter(
            "dump_seeded_total",
            "Connections first seen in a dump and seeded from it.",
        )?;
        let dump_evicted = counter(
            "dump_evicted_total",
            "Tracked connections missing from a dump and dropped.",
        )?;

        let connections_tracked = gauge(
            "connections_tracked",
            "Connection records currently held by the tracker.",
        )?;
        let intervals_flushed = counter("intervals_flushed_total", "Intervals written out.")?;
        let entries_flushed = counter(
            "entries_flushed_total",
            "Aggregate entries written across all intervals.",
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Time to write one interval.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        let port_reloads = CounterVec::new(
            Opts::new("port_reloads_total", "Port-file reloads by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let port_entries = gauge("port_entries", "Entries in the active port table.")?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_interesting.clone()))?;
        registry.register(Box::new(event_parse_errors.clone()))?;
        registry.register(Box::new(dumps_total.clone()))?;
        registry.register(Box::new(dump_failures.clone()))?;
        registry.register(Box::new(dump_duration.clone()))?;
        registry.register(Box::new(dump_flows.clone()))?;
        registry.register(Box::new(dump_seeded.clone()))?;
        registry.register(Box::new(dump_evicted.clone()))?;
        registry.register(Box::new(connections_tracked.clone()))?;
        registry.register(Box::new(intervals_flushed.clone()))?;
        registry.register(Box::new(entries_flushed.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(port_reloads.clone()))?;
        registry.register(Box::new(port_entries.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_interesting,
            event_parse_errors,
            dumps_total,
            dump_failures,
            dump_duration,
            dump_flows,
            dump_seeded,
            dump_evicted,
            connections_tracked,
            intervals_flushed,
            entries_flushed,
            flush_duration,
            port_reloads,
            port_entries,
        })
    }

    /// Fold an event-counter snapshot (counts since the previous one) into
    /// the event metrics.
    pub fn record_events(&self, snapshot: &EventStatsSnapshot) {
        for (event_type, count) in &snapshot.received {
            if *count > 0 {
                self.events_received
                    .with_label_values(&[event_type.as_str()])
                    .inc_by(*count as f64);
            }
        }
        self.events_interesting.inc_by(snapshot.interesting as f64);
        self.event_parse_errors.inc_by(snapshot.parse_errors as f64);
    }

    /// Renders the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz and returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "serving metrics");
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
