pub mod event_loop;
pub mod ports;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::DumpScheduler;
use crate::config::Config;
use crate::conntrack::stats::EventStats;
use crate::conntrack::sysctl::{self, ACCOUNTING_SYSCTL};
use crate::conntrack::FlowSource;
use crate::export::health::HealthMetrics;
use crate::sink::aggregated::dimension::KeyPolicy;
use crate::sink::aggregated::exporter::{Exporter, IntervalArchive};
use crate::sink::AggregatedSink;
use crate::tracker::ConnectionTracker;

use self::event_loop::{EventLoop, LoopInputs};
use self::ports::{PortFileWatcher, PortInterest, SharedPortInterest};

/// How long background tasks get to wind down after the loop exits.
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Agent wires the flow source, dump scheduler, port watcher and event
/// loop together and runs them until shutdown.
pub struct Agent<S> {
    cfg: Config,
    source: Arc<S>,
    health: Arc<HealthMetrics>,
    output: Option<Exporter>,
    sysctl_path: PathBuf,
    cancel: CancellationToken,
}

impl<S: FlowSource> Agent<S> {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config, source: S) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            source: Arc::new(source),
            health,
            output: None,
            sysctl_path: PathBuf::from(ACCOUNTING_SYSCTL),
            cancel: CancellationToken::new(),
        })
    }

    /// Write intervals to `exporter` instead of the configured output.
    pub fn with_output(mut self, exporter: Exporter) -> Self {
        self.output = Some(exporter);
        self
    }

    /// Use a different file for the accounting switch.
    pub fn with_sysctl_path(mut self, path: PathBuf) -> Self {
        self.sysctl_path = path;
        self
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Run until `shutdown` fires or a component fails.
    pub async fn run(mut self, shutdown: oneshot::Receiver<&'static str>) -> Result<()> {
        let mut tasks = Vec::new();
        let result = self.run_inner(shutdown, &mut tasks).await;

        self.cancel.cancel();
        for task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_GRACE, task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }

        if self.cfg.health.enabled {
            self.health
                .stop()
                .await
                .context("stopping health metrics server")?;
        }

        info!("agent stopped");
        result
    }

    async fn run_inner(
        &mut self,
        shutdown: oneshot::Receiver<&'static str>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        // 0. Start health metrics server.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Make sure the kernel keeps per-flow counters.
        if self.cfg.conntrack.enable_accounting {
            self.enable_accounting();
        }

        // 2. Port-interest table and its watcher.
        let ports = self.load_ports()?;
        let (reload_tx, reload_rx) = mpsc::channel(4);
        if let Some(path) = &self.cfg.ports.file {
            let watcher = PortFileWatcher::new(
                path.clone(),
                Arc::clone(&ports),
                self.cfg.ports.poll_interval,
                self.cfg.ports.settle_delay,
            );
            tasks.push(watcher.spawn(self.cancel.child_token(), reload_tx).await);
        }

        // 3. Filter, key policy and tracker.
        let filter = self.cfg.flow_filter()?;
        let (source_mask, destination_mask) = self.cfg.group_masks()?;
        let tracker = ConnectionTracker::new(KeyPolicy::new(source_mask, destination_mask, ports));

        // 4. Output sink.
        let primary = match self.output.take() {
            Some(exporter) => exporter,
            None => Exporter::open(&self.cfg.output).context("opening output")?,
        };
        let mut sink = AggregatedSink::new(primary, self.cfg.track_open_connections);
        if let Some(folder) = &self.cfg.output.folder {
            sink = sink.with_archive(IntervalArchive::new(folder.clone())?);
        }

        info!(
            interval_secs = self.cfg.interval.as_secs(),
            source = ?filter.source,
            destination = ?filter.destination,
            exclude_ip = ?filter.exclude_ip,
            include_icmp = filter.include_icmp,
            %source_mask,
            %destination_mask,
            output = sink.name(),
            archive = ?self.cfg.output.folder,
            track_open = self.cfg.track_open_connections,
            "accounting configured",
        );

        // 5. Subscribe to live events before the first dump.
        let stats = Arc::new(EventStats::new());
        let stream = self
            .source
            .subscribe(self.cancel.child_token(), Arc::clone(&stats))
            .with_context(|| format!("subscribing to {}", self.source.name()))?;
        info!(source = self.source.name(), "event subscription started");

        // 6. Dump scheduler; a single slot keeps one dump in flight.
        let (dump_tx, dump_rx) = mpsc::channel(1);
        let scheduler = DumpScheduler::new(
            Arc::clone(&self.source),
            self.cfg.interval,
            self.cfg.dump.retry_policy(),
        )?
        .with_health(Arc::clone(&self.health));
        tasks.push(scheduler.spawn(self.cancel.child_token(), dump_tx));

        // 7. Event loop owns all accounting state from here on.
        let event_loop =
            EventLoop::new(filter, tracker, sink, stats).with_health(Arc::clone(&self.health));

        event_loop
            .run(LoopInputs {
                events: stream.events,
                source_errors: stream.errors,
                dumps: dump_rx,
                reloads: reload_rx,
                shutdown,
            })
            .await
    }

    fn enable_accounting(&self) {
        match sysctl::enable_accounting(&self.sysctl_path) {
            Ok(true) => {
                info!("enabled conntrack accounting; connections opened before now carry no counters")
            }
            Ok(false) => debug!("conntrack accounting already enabled"),
            Err(e) => warn!(
                error = %e,
                "could not enable conntrack accounting, run `sysctl -w net.netfilter.nf_conntrack_acct=1`",
            ),
        }
    }

    fn load_ports(&self) -> Result<SharedPortInterest> {
        let table = match &self.cfg.ports.file {
            Some(path) => {
                let table = PortInterest::load(path)
                    .with_context(|| format!("loading port file {}", path.display()))?;
                info!(path = %path.display(), entries = table.len(), "port table loaded");
                self.health.port_entries.set(table.len() as f64);
                table
            }
            None => PortInterest::default(),
        };

        Ok(Arc::new(ArcSwap::from_pointee(table)))
    }
}
