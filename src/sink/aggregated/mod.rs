pub mod aggregate;
pub mod buffer;
pub mod csv;
pub mod dimension;
pub mod exporter;

use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tracing::debug;

use self::buffer::AccountingTable;
use self::exporter::{Exporter, IntervalArchive};

/// Outcome of one interval flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub entries: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// Interval accounting plus its output targets.
///
/// The table is filled by the event loop between dumps; `flush` writes one
/// line per entry to the primary exporter (and the archive, if any) and
/// starts a fresh interval.
pub struct AggregatedSink {
    table: AccountingTable,
    primary: Exporter,
    archive: Option<IntervalArchive>,
    include_open: bool,
    line_buf: String,
}

impl AggregatedSink {
    pub fn new(primary: Exporter, include_open: bool) -> Self {
        Self {
            table: AccountingTable::new(),
            primary,
            archive: None,
            include_open,
            line_buf: String::with_capacity(64 * 1024),
        }
    }

    /// Also copy each interval into a per-interval archive file.
    pub fn with_archive(mut self, archive: IntervalArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn name(&self) -> &'static str {
        self.primary.name()
    }

    /// Whether rows carry the open-connection column.
    pub fn include_open(&self) -> bool {
        self.include_open
    }

    pub fn table(&self) -> &AccountingTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut AccountingTable {
        &mut self.table
    }

    /// Emit the current interval stamped with `timestamp` and clear it.
    ///
    /// Lines are ordered by key so consecutive intervals diff cleanly. An
    /// empty interval writes nothing.
    pub fn flush(&mut self, timestamp: SystemTime) -> Result<FlushStats> {
        let started = Instant::now();

        let mut rows: Vec<_> = self.table.take().into_iter().collect();
        rows.sort_unstable_by_key(|(key, _)| *key);

        let ts = csv::unix_nanos(timestamp);
        self.line_buf.clear();
        for (key, entry) in &rows {
            csv::write_row(&mut self.line_buf, ts, key, entry, self.include_open)
                .context("formatting interval row")?;
        }

        if !self.line_buf.is_empty() {
            self.primary.write_interval(self.line_buf.as_bytes())?;

            if let Some(archive) = &self.archive {
                let path = archive.write(timestamp, self.line_buf.as_bytes())?;
                debug!(path = %path.display(), "interval archived");
            }
        }

        Ok(FlushStats {
            entries: rows.len(),
            bytes: self.line_buf.len(),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    use parking_lot::Mutex;

    use super::dimension::AggregationKey;
    use super::*;
    use crate::conntrack::event::{PROTO_TCP, PROTO_UDP};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).expect("utf8")
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

    fn key(protocol: u8, last: u8, port: Option<u16>) -> AggregationKey {
        AggregationKey {
            protocol,
            source: Ipv4Addr::new(10, 0, 0, last),
            destination: Ipv4Addr::new(10, 0, 1, 9),
            port,
        }
    }

    fn sink(include_open: bool) -> (AggregatedSink, SharedBuf) {
        let buf = SharedBuf::default();
        let sink = AggregatedSink::new(Exporter::Writer(Box::new(buf.clone())), include_open);
        (sink, buf)
    }

    fn ts() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_010)
    }

    #[test]
    fn test_flush_writes_sorted_rows_and_resets() {
        let (mut sink, buf) = sink(false);
        sink.table_mut().account_open(key(PROTO_UDP, 2, None));
        sink.table_mut().account_open(key(PROTO_TCP, 7, Some(443)));
        sink.table_mut().account_open(key(PROTO_TCP, 3, Some(22)));

        let stats = sink.flush(ts()).expect("flush");
        assert_eq!(stats.entries, 3);
        assert!(sink.table().is_empty());

        let text = buf.text();
        assert_eq!(stats.bytes, text.len());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "1700000010000000000,tcp,10.0.0.3,10.0.1.9,22,0,0,0,0,0,0",
                "1700000010000000000,tcp,10.0.0.7,10.0.1.9,443,0,0,0,0,0,0",
                "1700000010000000000,udp,10.0.0.2,10.0.1.9,-1,0,0,0,0,0,0",
            ]
        );
    }

    #[test]
    fn test_flush_includes_open_column() {
        let (mut sink, buf) = sink(true);
        sink.table_mut().account_open(key(PROTO_TCP, 3, Some(22)));
        sink.table_mut().account_open(key(PROTO_TCP, 3, Some(22)));

        sink.flush(ts()).expect("flush");
        assert_eq!(
            buf.text(),
            "1700000010000000000,tcp,10.0.0.3,10.0.1.9,22,0,0,0,0,0,0,2\n"
        );
    }

    #[test]
    fn test_empty_interval_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = IntervalArchive::new(dir.path().to_path_buf()).expect("archive");
        let (sink, buf) = sink(false);
        let mut sink = sink.with_archive(archive);

        let stats = sink.flush(ts()).expect("flush");
        assert_eq!(stats.entries, 0);
        assert!(buf.text().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn test_flush_copies_to_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = IntervalArchive::new(dir.path().to_path_buf()).expect("archive");
        let path = archive.path_for(ts());
        let (sink, buf) = sink(false);
        let mut sink = sink.with_archive(archive);

        sink.table_mut().account_open(key(PROTO_TCP, 3, Some(22)));
        sink.flush(ts()).expect("flush");

        let archived = std::fs::read_to_string(path).expect("archive file");
        assert_eq!(archived, buf.text());
    }
}
