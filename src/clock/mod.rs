use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conntrack::event::{DumpSnapshot, Flow};
use crate::conntrack::FlowSource;
use crate::export::health::HealthMetrics;

/// Smallest multiple of `interval_secs` (counted from the Unix epoch) that
/// is strictly later than `now`.
pub fn next_boundary(now: SystemTime, interval_secs: u64) -> SystemTime {
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    UNIX_EPOCH + Duration::from_secs((secs / interval_secs + 1) * interval_secs)
}

/// `now` with the sub-second part dropped.
pub fn truncate_to_second(now: SystemTime) -> SystemTime {
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// How often a failing dump is retried before the scheduler gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per dump, the first one included.
    pub attempts: u32,
    /// Wait after the first failure; doubled after each further one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failure number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << shift)
    }
}

/// Wall-clock-aligned producer of full-table dumps.
///
/// Fires once immediately, then at every multiple of the interval. At most
/// one dump is outstanding: the next one is not started before the event
/// loop has received the previous. A dump that still fails after all retry
/// attempts is delivered as `Err` and the scheduler stops.
pub struct DumpScheduler<S> {
    source: Arc<S>,
    interval_secs: u64,
    retry: RetryPolicy,
    health: Option<Arc<HealthMetrics>>,
}

impl<S> std::fmt::Debug for DumpScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpScheduler")
            .field("interval_secs", &self.interval_secs)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<S: FlowSource> DumpScheduler<S> {
    pub fn new(source: Arc<S>, interval: Duration, retry: RetryPolicy) -> Result<Self> {
        if interval.as_secs() == 0 || interval.subsec_nanos() != 0 {
            bail!("dump interval must be a whole number of seconds > 0, got {interval:?}");
        }

        if retry.attempts == 0 {
            bail!("retry attempts must be > 0");
        }

        Ok(Self {
            source,
            interval_secs: interval.as_secs(),
            retry,
            health: None,
        })
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Run the schedule until `ctx` is cancelled, the receiver goes away,
    /// or a dump fails for good.
    pub fn spawn(
        self,
        ctx: CancellationToken,
        tx: mpsc::Sender<Result<DumpSnapshot>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(ctx, tx).await })
    }

    async fn run(self, ctx: CancellationToken, tx: mpsc::Sender<Result<DumpSnapshot>>) {
        info!(
            source = self.source.name(),
            interval_secs = self.interval_secs,
            "dump scheduler started",
        );

        let mut first = true;

        loop {
            let permit = tokio::select! {
                _ = ctx.cancelled() => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("dump receiver closed");
                        break;
                    }
                },
            };

            let now = SystemTime::now();
            let target = if first {
                truncate_to_second(now)
            } else {
                next_boundary(now, self.interval_secs)
            };
            first = false;

            let delay = target
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = ctx.cancelled() => break,
                result = self.fetch() => result,
            };

            match result {
                Ok((fetched_at, flows)) => permit.send(Ok(DumpSnapshot {
                    timestamp: target,
                    fetched_at,
                    flows,
                })),
                Err(e) => {
                    permit.send(Err(e));
                    break;
                }
            }
        }

        debug!("dump scheduler stopped");
    }

    /// Fetch one dump, retrying per policy. Returns the start of the
    /// successful attempt along with its flows.
    async fn fetch(&self) -> Result<(Instant, Vec<Flow>)> {
        let started = Instant::now();
        let mut failures = 0u32;

        loop {
            let attempt = Instant::now();
            match self.source.dump().await {
                Ok(flows) => {
                    if let Some(h) = &self.health {
                        h.dumps_total.inc();
                        h.dump_duration.observe(started.elapsed().as_secs_f64());
                        h.dump_flows.set(flows.len() as f64);
                    }
                    return Ok((attempt, flows));
                }
                Err(e) => {
                    failures += 1;
                    if let Some(h) = &self.health {
                        h.dump_failures.inc();
                    }

                    if failures >= self.retry.attempts {
                        return Err(e.context(format!("dump failed after {failures} attempts")));
                    }

                    let delay = self.retry.delay(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "dump failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use parking_lot::Mutex;

    use super::*;
    use crate::conntrack::event::{Counters, PROTO_TCP};
    use crate::conntrack::stats::EventStats;
    use crate::conntrack::EventStream;

    #[derive(Default)]
    struct ScriptedSource {
        results: Mutex<VecDeque<Result<Vec<Flow>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn with_results(results: Vec<Result<Vec<Flow>>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FlowSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn subscribe(
            &self,
            _ctx: CancellationToken,
            _stats: Arc<EventStats>,
        ) -> Result<EventStream> {
            bail!("scripted source has no events")
        }

        async fn dump(&self) -> Result<Vec<Flow>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.results.lock().pop_front();
            next.unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn flow(id: u32) -> Flow {
        Flow::v4(
            id,
            PROTO_TCP,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 9),
            40000,
            443,
        )
        .with_counters(Counters::new(1, 60), Counters::new(1, 60))
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_next_boundary() {
        let at = |s: u64, ms: u64| UNIX_EPOCH + Duration::from_secs(s) + Duration::from_millis(ms);

        assert_eq!(next_boundary(at(100, 0), 15), at(105, 0));
        assert_eq!(next_boundary(at(104, 999), 15), at(105, 0));
        // Exactly on a boundary moves to the next one.
        assert_eq!(next_boundary(at(105, 0), 15), at(120, 0));
        assert_eq!(next_boundary(at(105, 1), 15), at(120, 0));
        assert_eq!(next_boundary(at(7, 500), 1), at(8, 0));
    }

    #[test]
    fn test_truncate_to_second() {
        let ts = UNIX_EPOCH + Duration::from_millis(1_700_000_010_750);
        assert_eq!(
            truncate_to_second(ts),
            UNIX_EPOCH + Duration::from_secs(1_700_000_010)
        );
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_new_rejects_bad_interval() {
        let source = ScriptedSource::with_results(Vec::new());

        let err = DumpScheduler::new(Arc::clone(&source), Duration::ZERO, fast_retry(1))
            .expect_err("zero interval");
        assert!(err.to_string().contains("whole number of seconds"));

        assert!(
            DumpScheduler::new(Arc::clone(&source), Duration::from_millis(1500), fast_retry(1))
                .is_err()
        );
        assert!(DumpScheduler::new(source, Duration::from_secs(2), fast_retry(0)).is_err());
    }

    #[tokio::test]
    async fn test_first_dump_is_immediate() {
        let source = ScriptedSource::with_results(vec![Ok(vec![flow(1), flow(2)])]);
        let scheduler = DumpScheduler::new(Arc::clone(&source), Duration::from_secs(60), fast_retry(1))
            .expect("scheduler");

        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = scheduler.spawn(ctx.clone(), tx);

        let before = SystemTime::now();
        let snapshot = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("dump within timeout")
            .expect("channel open")
            .expect("dump ok");

        assert_eq!(snapshot.flows.len(), 2);
        assert_eq!(snapshot.timestamp, truncate_to_second(snapshot.timestamp));
        assert!(snapshot.timestamp <= before);

        ctx.cancel();
        handle.await.expect("join");
    }

    #[tokio::test]
    async fn test_only_one_dump_outstanding() {
        let source = ScriptedSource::with_results(Vec::new());
        let scheduler = DumpScheduler::new(Arc::clone(&source), Duration::from_secs(1), fast_retry(1))
            .expect("scheduler");

        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = scheduler.spawn(ctx.clone(), tx);

        // Nobody receives: the first dump parks in the channel and the
        // scheduler waits instead of fetching again.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(source.calls(), 1);

        let first = rx.recv().await.expect("first").expect("ok");
        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("second within timeout")
            .expect("channel open")
            .expect("ok");
        assert!(second.timestamp > first.timestamp);
        assert_eq!(second.timestamp, truncate_to_second(second.timestamp));

        ctx.cancel();
        handle.await.expect("join");
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let source = ScriptedSource::with_results(vec![
            Err(anyhow!("netlink busy")),
            Err(anyhow!("netlink busy")),
            Ok(vec![flow(7)]),
        ]);
        let scheduler = DumpScheduler::new(Arc::clone(&source), Duration::from_secs(60), fast_retry(3))
            .expect("scheduler");

        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let spawned = Instant::now();
        let handle = scheduler.spawn(ctx.clone(), tx);

        let snapshot = rx.recv().await.expect("channel open").expect("dump ok");
        assert_eq!(snapshot.flows.len(), 1);
        assert_eq!(source.calls(), 3);
        // Stamped with the attempt that succeeded, after both backoffs.
        assert!(snapshot.fetched_at >= spawned + Duration::from_millis(15));

        ctx.cancel();
        handle.await.expect("join");
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal() {
        let source = ScriptedSource::with_results(vec![
            Err(anyhow!("netlink busy")),
            Err(anyhow!("netlink gone")),
        ]);
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"));
        let scheduler = DumpScheduler::new(Arc::clone(&source), Duration::from_secs(60), fast_retry(2))
            .expect("scheduler")
            .with_health(Arc::clone(&health));

        let (tx, mut rx) = mpsc::channel(1);
        let handle = scheduler.spawn(CancellationToken::new(), tx);

        let err = rx
            .recv()
            .await
            .expect("channel open")
            .expect_err("dump should fail");
        assert!(err.to_string().contains("after 2 attempts"));
        assert!(format!("{err:#}").contains("netlink gone"));

        // The scheduler exits, closing the channel.
        assert!(rx.recv().await.is_none());
        handle.await.expect("join");
        assert_eq!(health.dump_failures.get(), 2.0);
        assert_eq!(health.dumps_total.get(), 0.0);
    }

    #[tokio::test]
    async fn test_cancel_stops_scheduler() {
        let source = ScriptedSource::with_results(Vec::new());
        let scheduler = DumpScheduler::new(Arc::clone(&source), Duration::from_secs(60), fast_retry(1))
            .expect("scheduler");

        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = scheduler.spawn(ctx.clone(), tx);

        rx.recv().await.expect("first").expect("ok");
        ctx.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stops promptly")
            .expect("join");
        assert!(rx.recv().await.is_none());
    }
}
