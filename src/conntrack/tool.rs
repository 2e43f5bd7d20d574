use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConntrackConfig;

use super::event::Flow;
use super::parse::{parse_event_line, parse_flow_line, ParseError};
use super::stats::EventStats;
use super::{EventStream, FlowSource};

const OUTPUT_FORMAT: &str = "extended,id";

/// FlowSource backed by the conntrack-tools command line utility.
///
/// Events come from a long-running `conntrack -E`, dumps from one-shot
/// `conntrack -L` invocations.
#[derive(Debug, Clone)]
pub struct ConntrackTool {
    binary: PathBuf,
    event_buffer: usize,
    socket_buffer_size: Option<usize>,
}

impl ConntrackTool {
    pub fn new(binary: impl Into<PathBuf>, event_buffer: usize) -> Self {
        Self {
            binary: binary.into(),
            event_buffer,
            socket_buffer_size: None,
        }
    }

    /// Build from the `conntrack` configuration section.
    pub fn from_config(cfg: &ConntrackConfig) -> Self {
        let tool = Self::new(&cfg.binary, cfg.event_buffer);
        match cfg.socket_buffer_size {
            0 => tool,
            bytes => tool.with_socket_buffer_size(bytes),
        }
    }

    /// Request a netlink receive buffer of `bytes` for the event socket.
    pub fn with_socket_buffer_size(mut self, bytes: usize) -> Self {
        self.socket_buffer_size = Some(bytes);
        self
    }

    fn event_args(&self) -> Vec<String> {
        let mut args = vec!["-E".to_string(), "-o".to_string(), OUTPUT_FORMAT.to_string()];
        if let Some(bytes) = self.socket_buffer_size {
            args.push("--buffer-size".to_string());
            args.push(bytes.to_string());
        }
        args
    }
}

impl FlowSource for ConntrackTool {
    fn name(&self) -> &str {
        "conntrack-tools"
    }

    fn subscribe(&self, ctx: CancellationToken, stats: Arc<EventStats>) -> Result<EventStream> {
        let mut child = Command::new(&self.binary)
            .args(self.event_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} -E", self.binary.display()))?;

        let stdout = child
            .stdout
            .take()
            .context("conntrack event stdout not captured")?;

        let (event_tx, events) = mpsc::channel(self.event_buffer);
        let (error_tx, errors) = mpsc::channel(1);

        info!(
            binary = %self.binary.display(),
            buffer = self.event_buffer,
            "conntrack event stream started",
        );

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        let _ = child.kill().await;
                        debug!("conntrack event reader stopped");
                        return;
                    }
                    line = lines.next_line() => {
                        let line = match line {
                            Ok(Some(line)) => line,
                            Ok(None) => {
                                let status = child.wait().await;
                                let err = match status {
                                    Ok(status) => anyhow!("conntrack event stream ended ({status})"),
                                    Err(e) => anyhow!(e).context("conntrack event stream ended"),
                                };
                                let _ = error_tx.send(err).await;
                                return;
                            }
                            Err(e) => {
                                let _ = error_tx
                                    .send(anyhow!(e).context("reading conntrack event stream"))
                                    .await;
                                return;
                            }
                        };

                        match parse_event_line(&line) {
                            Ok(event) => {
                                stats.record(event.event_type);
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(ParseError::Empty) => {}
                            Err(e) => {
                                stats.record_parse_error();
                                debug!(error = %e, line = %line, "skipping conntrack event line");
                            }
                        }
                    }
                }
            }
        });

        Ok(EventStream { events, errors })
    }

    async fn dump(&self) -> Result<Vec<Flow>> {
        let output = Command::new(&self.binary)
            .args(["-L", "-o", OUTPUT_FORMAT])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running {} -L", self.binary.display()))?;

        if !output.status.success() {
            bail!(
                "conntrack -L failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }

        let (flows, skipped) = parse_listing(&String::from_utf8_lossy(&output.stdout));
        if skipped > 0 {
            debug!(skipped, "skipped unparseable conntrack listing lines");
        }

        Ok(flows)
    }
}

/// Parse a full `conntrack -L` listing, returning the flows and the number
/// of non-empty lines that could not be parsed.
pub fn parse_listing(text: &str) -> (Vec<Flow>, usize) {
    let mut flows = Vec::new();
    let mut skipped = 0;

    for line in text.lines() {
        match parse_flow_line(line) {
            Ok(flow) => flows.push(flow),
            Err(ParseError::Empty) => {}
            Err(_) => skipped += 1,
        }
    }

    (flows, skipped)
}
