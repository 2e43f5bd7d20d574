use std::collections::HashMap;
use std::time::Instant;

use crate::conntrack::event::Counters;
use crate::tracker::ConnectionRecord;

use super::aggregate::AggregateEntry;
use super::dimension::AggregationKey;

/// Interval-scoped accounting table.
///
/// Owned by the event loop alongside the connection tracker; entries are
/// created on first touch and the whole table is taken at flush time.
#[derive(Debug, Default)]
pub struct AccountingTable {
    entries: HashMap<AggregationKey, AggregateEntry>,
}

impl AccountingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold whatever the record's cumulative counters gained since the last
    /// call into the record's entry, then advance its high-water marks.
    ///
    /// Returns `false` when no counter advanced; no entry is created then.
    pub fn account_traffic(&mut self, record: &mut ConnectionRecord) -> bool {
        let src_to_dst = advance(&mut record.orig_accounted, record.orig);
        let dst_to_src = advance(&mut record.reply_accounted, record.reply);

        if src_to_dst == Counters::default() && dst_to_src == Counters::default() {
            return false;
        }

        self.entries
            .entry(record.key)
            .or_default()
            .add_traffic(src_to_dst, dst_to_src);
        true
    }

    /// Count the record's connection as closed. Only the first call for a
    /// record has any effect; records that never tracked duration are
    /// ignored.
    pub fn account_close(&mut self, record: &mut ConnectionRecord, now: Instant) -> bool {
        if record.tracking_disabled {
            return false;
        }
        record.tracking_disabled = true;

        let duration_ms = record.created.map_or(0, |created| {
            u64::try_from(now.saturating_duration_since(created).as_millis()).unwrap_or(u64::MAX)
        });

        self.entries
            .entry(record.key)
            .or_default()
            .add_close(duration_ms);
        true
    }

    /// Count one open connection under `key`.
    pub fn account_open(&mut self, key: AggregationKey) {
        self.entries.entry(key).or_default().add_open();
    }

    pub fn get(&self, key: &AggregationKey) -> Option<&AggregateEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AggregationKey, &AggregateEntry)> {
        self.entries.iter()
    }

    /// Take every entry, leaving an empty table behind.
    pub fn take(&mut self) -> HashMap<AggregationKey, AggregateEntry> {
        let capacity = self.entries.len();
        std::mem::replace(&mut self.entries, HashMap::with_capacity(capacity))
    }
}

/// Per counter: if cumulative moved past accounted, return the difference
/// and move accounted up to it. Never goes backwards.
fn advance(accounted: &mut Counters, cumulative: Counters) -> Counters {
    let mut delta = Counters::default();

    if cumulative.packets > accounted.packets {
        delta.packets = cumulative.packets - accounted.packets;
        accounted.packets = cumulative.packets;
    }
    if cumulative.bytes > accounted.bytes {
        delta.bytes = cumulative.bytes - accounted.bytes;
        accounted.bytes = cumulative.bytes;
    }

    delta
}
