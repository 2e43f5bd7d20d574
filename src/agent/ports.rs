use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Port-interest table shared between the reload task and the event loop.
pub type SharedPortInterest = Arc<ArcSwap<PortInterest>>;

/// Errors raised while reading a port file.
#[derive(Error, Debug)]
pub enum PortFileError {
    #[error("line {line}: expected protocol:port, got {text:?}")]
    Malformed { line: usize, text: String },

    #[error("line {line}: invalid port {value:?}")]
    InvalidPort { line: usize, value: String },

    #[error("reading {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Set of (protocol name, destination port) pairs that keep their port in
/// aggregation keys. An empty table treats every port as interesting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInterest {
    ports: HashMap<String, HashSet<u16>>,
    entries: usize,
}

impl PortInterest {
    /// Build a table from explicit pairs.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, u16)>) -> Self {
        let mut table = Self::default();
        for (protocol, port) in entries {
            table.insert(protocol, port);
        }
        table
    }

    /// Parse port-file text.
    ///
    /// Blank lines and lines starting with `#` are skipped. Every other line
    /// must be `protocol:port`; the first bad line fails the whole parse.
    pub fn parse(text: &str) -> Result<Self, PortFileError> {
        let mut table = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split(':');
            let (Some(protocol), Some(port), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(PortFileError::Malformed {
                    line: idx + 1,
                    text: line.to_string(),
                });
            };

            let port: u16 = port.trim().parse().map_err(|_| PortFileError::InvalidPort {
                line: idx + 1,
                value: port.to_string(),
            })?;

            table.insert(protocol.trim(), port);
        }

        Ok(table)
    }

    /// Read and parse a port file.
    pub fn load(path: &Path) -> Result<Self, PortFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| PortFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Like [`PortInterest::load`], for use on the runtime.
    pub async fn load_async(path: &Path) -> Result<Self, PortFileError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PortFileError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }

    fn insert(&mut self, protocol: &str, port: u16) {
        if self
            .ports
            .entry(protocol.to_ascii_lowercase())
            .or_default()
            .insert(port)
        {
            self.entries += 1;
        }
    }

    pub fn is_interesting(&self, protocol: &str, port: u16) -> bool {
        if self.entries == 0 {
            return true;
        }
        self.ports
            .get(protocol)
            .is_some_and(|ports| ports.contains(&port))
    }

    /// Number of distinct (protocol, port) pairs.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Result of a port-file reload, reported to the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortReload {
    /// The new table is live.
    Applied { entries: usize },
    /// The file was rejected; the previous table stays live.
    Rejected { error: String },
}

/// Polls a port file and swaps in a fresh table whenever it changes.
pub struct PortFileWatcher {
    path: PathBuf,
    table: SharedPortInterest,
    poll_interval: Duration,
    settle_delay: Duration,
}

impl PortFileWatcher {
    pub fn new(
        path: PathBuf,
        table: SharedPortInterest,
        poll_interval: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            path,
            table,
            poll_interval,
            settle_delay,
        }
    }

    /// Record the file's current state, then spawn the polling task. Each
    /// reload attempt is reported on `notify`.
    pub async fn spawn(
        self,
        ctx: CancellationToken,
        notify: mpsc::Sender<PortReload>,
    ) -> JoinHandle<()> {
        let mut last_seen = fingerprint(&self.path).await;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let current = fingerprint(&self.path).await;
                if current.is_none() || current == last_seen {
                    continue;
                }

                debug!(path = %self.path.display(), "port file changed");

                // Writers often truncate then fill; give them time to finish.
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(self.settle_delay) => {}
                }

                last_seen = fingerprint(&self.path).await;
                let outcome = self.reload().await;

                tokio::select! {
                    _ = ctx.cancelled() => return,
                    sent = notify.send(outcome) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn reload(&self) -> PortReload {
        match PortInterest::load_async(&self.path).await {
            Ok(table) => {
                let entries = table.len();
                self.table.store(Arc::new(table));
                PortReload::Applied { entries }
            }
            Err(e) => PortReload::Rejected {
                error: format!("{:#}", anyhow::Error::new(e)),
            },
        }
    }
}

/// Modification time and size, used to detect file changes.
async fn fingerprint(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok()?, meta.len()))
}
