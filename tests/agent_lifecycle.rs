use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use conntrack_accounting::agent::Agent;
use conntrack_accounting::config::Config;
use conntrack_accounting::conntrack::event::{Counters, EventType, Flow, FlowEvent, PROTO_TCP};
use conntrack_accounting::conntrack::stats::EventStats;
use conntrack_accounting::conntrack::{EventStream, FlowSource};
use conntrack_accounting::sink::aggregated::exporter::Exporter;

const EVENT_CAPACITY: usize = 16;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().clone()).expect("utf8 output")
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// FlowSource fed by the test through channels and a dump script.
struct ScriptedSource {
    stream: Mutex<Option<EventStream>>,
    dumps: Mutex<VecDeque<Vec<Flow>>>,
    dump_calls: Arc<AtomicUsize>,
}

struct SourceHandle {
    events: mpsc::Sender<FlowEvent>,
    errors: mpsc::Sender<anyhow::Error>,
    dump_calls: Arc<AtomicUsize>,
}

fn scripted(dumps: Vec<Vec<Flow>>) -> (ScriptedSource, SourceHandle) {
    let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
    let (errors_tx, errors) = mpsc::channel(1);
    let dump_calls = Arc::new(AtomicUsize::new(0));

    (
        ScriptedSource {
            stream: Mutex::new(Some(EventStream { events, errors })),
            dumps: Mutex::new(dumps.into()),
            dump_calls: Arc::clone(&dump_calls),
        },
        SourceHandle {
            events: events_tx,
            errors: errors_tx,
            dump_calls,
        },
    )
}

impl FlowSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn subscribe(&self, _ctx: CancellationToken, _stats: Arc<EventStats>) -> Result<EventStream> {
        self.stream.lock().take().context("already subscribed")
    }

    async fn dump(&self) -> Result<Vec<Flow>> {
        self.dump_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.dumps.lock().pop_front();
        Ok(next.unwrap_or_default())
    }
}

fn flow(id: u32, src_last: u8, dport: u16) -> Flow {
    Flow::v4(
        id,
        PROTO_TCP,
        Ipv4Addr::new(10, 0, 0, src_last),
        Ipv4Addr::new(10, 0, 1, 9),
        40000,
        dport,
    )
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.interval = Duration::from_secs(60);
    cfg.conntrack.enable_accounting = false;
    cfg
}

/// Sum a numeric column over every output line.
fn column_sum(text: &str, column: usize) -> u64 {
    text.lines()
        .map(|line| {
            line.split(',')
                .nth(column)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_else(|| panic!("bad line {line:?}"))
        })
        .sum()
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn agent_accounts_events_and_flushes_on_shutdown() {
    let seeded = flow(1, 5, 22).with_counters(Counters::new(5, 500), Counters::new(4, 400));
    let (source, handle) = scripted(vec![vec![seeded]]);
    let out = SharedBuf::default();

    let agent = Agent::new(test_config(), source)
        .expect("agent")
        .with_output(Exporter::Writer(Box::new(out.clone())));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(agent.run(shutdown_rx));

    wait_for(|| handle.dump_calls.load(Ordering::SeqCst) >= 1).await;

    let short = flow(2, 6, 443);
    handle
        .events
        .send(FlowEvent::new(EventType::New, short.clone()))
        .await
        .expect("send new");
    handle
        .events
        .send(FlowEvent::new(
            EventType::Destroy,
            short.with_counters(Counters::new(3, 300), Counters::new(2, 200)),
        ))
        .await
        .expect("send destroy");

    wait_for(|| handle.events.capacity() == EVENT_CAPACITY).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send("SIGTERM").expect("signal");
    task.await.expect("join").expect("clean shutdown");

    let text = out.text();
    assert_eq!(column_sum(&text, 5), 3, "{text}");
    assert_eq!(column_sum(&text, 6), 2, "{text}");
    assert_eq!(column_sum(&text, 7), 300, "{text}");
    assert_eq!(column_sum(&text, 8), 200, "{text}");
    assert_eq!(column_sum(&text, 9), 1, "{text}");
    assert!(text
        .lines()
        .all(|line| line.contains(",tcp,10.0.0.6,10.0.1.9,443,")));
}

#[tokio::test]
async fn agent_fails_when_source_breaks() {
    let (source, handle) = scripted(Vec::new());
    let agent = Agent::new(test_config(), source)
        .expect("agent")
        .with_output(Exporter::Writer(Box::new(SharedBuf::default())));
    let (_shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(agent.run(shutdown_rx));

    handle
        .errors
        .send(anyhow!("conntrack exited with status 1"))
        .await
        .expect("send error");

    let err = task.await.expect("join").expect_err("source failure is fatal");
    assert!(format!("{err:#}").contains("conntrack exited with status 1"));
}

#[tokio::test]
async fn agent_enables_accounting_switch() {
    let switch = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(switch.path(), "0\n").expect("write");

    let mut cfg = test_config();
    cfg.conntrack.enable_accounting = true;

    let (source, handle) = scripted(Vec::new());
    let agent = Agent::new(cfg, source)
        .expect("agent")
        .with_output(Exporter::Writer(Box::new(SharedBuf::default())))
        .with_sysctl_path(switch.path().to_path_buf());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(agent.run(shutdown_rx));

    wait_for(|| handle.dump_calls.load(Ordering::SeqCst) >= 1).await;
    shutdown_tx.send("SIGINT").expect("signal");
    task.await.expect("join").expect("clean shutdown");

    assert_eq!(std::fs::read_to_string(switch.path()).expect("read"), "1");
}

#[tokio::test]
async fn agent_rejects_missing_port_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config();
    cfg.ports.file = Some(dir.path().join("ports.txt"));

    let (source, _handle) = scripted(Vec::new());
    let agent = Agent::new(cfg, source)
        .expect("agent")
        .with_output(Exporter::Writer(Box::new(SharedBuf::default())));
    let (_shutdown_tx, shutdown_rx) = oneshot::channel();

    let err = agent.run(shutdown_rx).await.expect_err("missing port file");
    assert!(err.to_string().contains("loading port file"));
}
