use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::conntrack::event::{DumpSnapshot, FlowEvent};
use crate::conntrack::stats::EventStats;
use crate::export::health::HealthMetrics;
use crate::filter::FlowFilter;
use crate::sink::{AggregatedSink, FlushStats};
use crate::tracker::{ConnectionTracker, Reconciled};

use super::ports::PortReload;

/// Maximum events taken from the channel per loop iteration.
pub const EVENT_BATCH: usize = 256;

/// Channels feeding the event loop.
pub struct LoopInputs {
    pub events: mpsc::Receiver<FlowEvent>,
    /// Fatal transport failures of the event source.
    pub source_errors: mpsc::Receiver<anyhow::Error>,
    pub dumps: mpsc::Receiver<Result<DumpSnapshot>>,
    pub reloads: mpsc::Receiver<PortReload>,
    /// Carries the name of the termination signal.
    pub shutdown: oneshot::Receiver<&'static str>,
}

/// Single owner of the tracker and the interval table.
///
/// Live events, dumps, port reloads and shutdown all arrive here and are
/// applied one at a time, so no accounting state is ever shared.
pub struct EventLoop {
    filter: FlowFilter,
    tracker: ConnectionTracker,
    sink: AggregatedSink,
    stats: Arc<EventStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl EventLoop {
    pub fn new(
        filter: FlowFilter,
        tracker: ConnectionTracker,
        sink: AggregatedSink,
        stats: Arc<EventStats>,
    ) -> Self {
        Self {
            filter,
            tracker,
            sink,
            stats,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn sink(&self) -> &AggregatedSink {
        &self.sink
    }

    /// Apply one live event if it passes the flow filter.
    pub fn handle_event(&mut self, event: &FlowEvent, now: Instant) {
        if !self.filter.is_interesting(&event.flow) {
            return;
        }

        self.stats.record_interesting();
        self.tracker
            .handle_event(event, self.sink.table_mut(), now);
    }

    /// Reconcile a dump against tracked state, drop records the kernel no
    /// longer lists, then close the interval at the dump's timestamp.
    pub fn handle_dump(&mut self, dump: DumpSnapshot) -> Result<FlushStats> {
        let started = Instant::now();
        let table = self.sink.table_mut();

        let mut present = HashSet::with_capacity(dump.flows.len());
        let mut seeded = 0u64;
        for flow in dump.flows.iter().filter(|f| self.filter.is_interesting(f)) {
            present.insert(flow.id);
            if self.tracker.reconcile(flow, table) == Reconciled::Seeded {
                seeded += 1;
            }
        }
        let evicted = self.tracker.evict_missing(&present, dump.fetched_at, table);

        info!(
            interesting = present.len(),
            total = dump.flows.len(),
            seeded,
            evicted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dump reconciled",
        );

        let events = self.stats.snapshot();
        info!(
            interesting = events.interesting,
            received = events.total_received(),
            parse_errors = events.parse_errors,
            "events since last dump",
        );

        if let Some(h) = &self.health {
            h.record_events(&events);
            h.dump_seeded.inc_by(seeded as f64);
            h.dump_evicted.inc_by(evicted as f64);
            h.connections_tracked.set(self.tracker.len() as f64);
        }

        self.flush(dump.timestamp)
    }

    /// Log a port-table reload reported by the watcher.
    pub fn handle_reload(&self, reload: &PortReload) {
        match reload {
            PortReload::Applied { entries } => {
                info!(entries, "port table reloaded");
                if let Some(h) = &self.health {
                    h.port_reloads.with_label_values(&["applied"]).inc();
                    h.port_entries.set(*entries as f64);
                }
            }
            PortReload::Rejected { error } => {
                warn!(error = %error, "port file rejected, keeping previous table");
                if let Some(h) = &self.health {
                    h.port_reloads.with_label_values(&["rejected"]).inc();
                }
            }
        }
    }

    /// Write whatever the current interval holds, stamped with `timestamp`.
    ///
    /// On shutdown the caller passes the current time at full precision:
    /// the last interval ends when termination was requested, not on a
    /// dump boundary.
    pub fn finish(&mut self, timestamp: SystemTime) -> Result<FlushStats> {
        self.flush(timestamp)
    }

    fn flush(&mut self, timestamp: SystemTime) -> Result<FlushStats> {
        if self.sink.include_open() {
            let open = self.tracker.sample_open(self.sink.table_mut());
            debug!(open, "open connections sampled");
        }

        let stats = self
            .sink
            .flush(timestamp)
            .with_context(|| format!("flushing interval to {}", self.sink.name()))?;

        info!(
            entries = stats.entries,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "interval flushed",
        );

        if let Some(h) = &self.health {
            h.intervals_flushed.inc();
            h.entries_flushed.inc_by(stats.entries as f64);
            h.flush_duration.observe(stats.elapsed.as_secs_f64());
        }

        Ok(stats)
    }

    /// Process inputs until shutdown or a fatal error.
    ///
    /// Shutdown writes a final interval. A failed or vanished event source,
    /// a fatal dump error or a stopped scheduler end the loop with `Err`.
    pub async fn run(mut self, mut inputs: LoopInputs) -> Result<()> {
        let mut batch = Vec::with_capacity(EVENT_BATCH);

        loop {
            tokio::select! {
                biased;

                signal = &mut inputs.shutdown => {
                    let signal = signal.unwrap_or("shutdown");
                    info!(signal, "termination requested, writing final interval");
                    self.finish(SystemTime::now())?;
                    return Ok(());
                }

                Some(err) = inputs.source_errors.recv() => {
                    return Err(err.context("event source failed"));
                }

                dump = inputs.dumps.recv() => match dump {
                    Some(Ok(dump)) => {
                        self.handle_dump(dump)?;
                    }
                    Some(Err(e)) => return Err(e.context("dump scheduler gave up")),
                    None => bail!("dump scheduler stopped"),
                },

                Some(reload) = inputs.reloads.recv() => {
                    self.handle_reload(&reload);
                }

                received = inputs.events.recv_many(&mut batch, EVENT_BATCH) => {
                    if received == 0 {
                        bail!("event stream closed");
                    }

                    for event in batch.drain(..) {
                        self.handle_event(&event, Instant::now());
                    }
                }
            }
        }
    }
}
