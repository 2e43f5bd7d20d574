//! Per-flow delta state.
//!
//! The tracker remembers, for every conntrack entry it knows about, the
//! latest cumulative counters reported by the kernel and how much of them has
//! already been folded into the accounting table. Live events and periodic
//! dumps both feed it; whichever arrives first accounts the traffic, the other
//! finds nothing left to add.
//!
//! Dumps also bound how stale the tracker can get: an entry the kernel no
//! longer lists, and that no event has touched since the listing started,
//! is dropped even when its DESTROY event was lost.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::conntrack::event::{is_connection_oriented, Counters, EventType, Flow, FlowEvent, FlowId};
use crate::sink::aggregated::buffer::AccountingTable;
use crate::sink::aggregated::dimension::{AggregationKey, KeyPolicy};

/// State kept for one tracked conntrack entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Computed once at first sighting; never changes afterwards.
    pub key: AggregationKey,
    /// Latest cumulative counters, original direction.
    pub orig: Counters,
    /// Latest cumulative counters, reply direction.
    pub reply: Counters,
    /// Portion of `orig` already accounted.
    pub orig_accounted: Counters,
    /// Portion of `reply` already accounted.
    pub reply_accounted: Counters,
    /// Set when duration cannot or must no longer be measured: the entry
    /// predates us, its protocol has no lifecycle, or its close was counted.
    pub tracking_disabled: bool,
    /// Only present when duration tracking started with the entry.
    pub created: Option<Instant>,
    /// When the latest live event for the entry was handled. `None` for
    /// entries only ever seen in dumps.
    pub last_event: Option<Instant>,
}

impl ConnectionRecord {
    /// A fresh record with zeroed counters. Duration tracking is enabled iff
    /// `created` is given.
    pub fn new(key: AggregationKey, created: Option<Instant>) -> Self {
        Self {
            key,
            orig: Counters::default(),
            reply: Counters::default(),
            orig_accounted: Counters::default(),
            reply_accounted: Counters::default(),
            tracking_disabled: created.is_none(),
            created,
            last_event: None,
        }
    }

    /// Record for an entry first seen in a dump: everything it carried so
    /// far happened before we looked, so it counts as already accounted.
    pub fn seeded(key: AggregationKey, flow: &Flow) -> Self {
        Self {
            key,
            orig: flow.orig,
            reply: flow.reply,
            orig_accounted: flow.orig,
            reply_accounted: flow.reply,
            tracking_disabled: true,
            created: None,
            last_event: None,
        }
    }

    /// Overwrite cumulative counters with reported values. Directions the
    /// kernel reported as zero keep their previous values.
    pub fn apply_counters(&mut self, flow: &Flow) {
        if flow.orig.is_reported() {
            self.orig = flow.orig;
        }
        if flow.reply.is_reported() {
            self.reply = flow.reply;
        }
    }
}

/// Outcome of reconciling one dump entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The entry was already tracked; any counter progress was accounted.
    Known,
    /// Unknown entry with traffic; a tracking-disabled record was seeded.
    Seeded,
    /// Unknown entry without traffic; nothing was recorded.
    Skipped,
}

/// Owns every [`ConnectionRecord`], keyed by conntrack id.
#[derive(Debug)]
pub struct ConnectionTracker {
    connections: HashMap<FlowId, ConnectionRecord>,
    policy: KeyPolicy,
}

impl ConnectionTracker {
    pub fn new(policy: KeyPolicy) -> Self {
        Self {
            connections: HashMap::with_capacity(4096),
            policy,
        }
    }

    /// Apply one live event. `now` timestamps creations and closes.
    pub fn handle_event(&mut self, event: &FlowEvent, table: &mut AccountingTable, now: Instant) {
        match event.event_type {
            EventType::New => self.on_new(&event.flow, now),
            EventType::Update => self.on_update(&event.flow, table, now),
            EventType::Destroy => self.on_destroy(&event.flow, table, now),
        }
    }

    fn on_new(&mut self, flow: &Flow, now: Instant) {
        let created = is_connection_oriented(flow.protocol).then_some(now);
        let mut record = ConnectionRecord::new(self.policy.key_for(flow), created);
        record.last_event = Some(now);
        record.apply_counters(flow);
        self.connections.insert(flow.id, record);
    }

    fn on_update(&mut self, flow: &Flow, table: &mut AccountingTable, now: Instant) {
        // Updates for entries we never saw created wait for the next dump.
        let Some(record) = self.connections.get_mut(&flow.id) else {
            return;
        };

        record.last_event = Some(now);
        record.apply_counters(flow);
        table.account_traffic(record);

        if flow.is_tcp_terminal() {
            table.account_close(record, now);
        }
    }

    fn on_destroy(&mut self, flow: &Flow, table: &mut AccountingTable, now: Instant) {
        let Some(mut record) = self.connections.remove(&flow.id) else {
            return;
        };

        record.apply_counters(flow);
        table.account_traffic(&mut record);
        table.account_close(&mut record, now);
    }

    /// Reconcile one (already filtered) dump entry against tracked state.
    pub fn reconcile(&mut self, flow: &Flow, table: &mut AccountingTable) -> Reconciled {
        if let Some(record) = self.connections.get_mut(&flow.id) {
            record.apply_counters(flow);
            table.account_traffic(record);
            return Reconciled::Known;
        }

        if flow.orig.packets == 0 && flow.reply.packets == 0 {
            return Reconciled::Skipped;
        }

        let record = ConnectionRecord::seeded(self.policy.key_for(flow), flow);
        self.connections.insert(flow.id, record);
        Reconciled::Seeded
    }

    /// Drop records the kernel no longer lists.
    ///
    /// `present` holds the ids of the (filtered) dump fetched at
    /// `fetched_at`. A record missing from it is dropped unless an event was
    /// handled for it after the listing started. Pending traffic is
    /// accounted first; the drop itself never counts as a close.
    pub fn evict_missing(
        &mut self,
        present: &HashSet<FlowId>,
        fetched_at: Instant,
        table: &mut AccountingTable,
    ) -> usize {
        let before = self.connections.len();
        self.connections.retain(|id, record| {
            if present.contains(id) || record.last_event.is_some_and(|seen| seen >= fetched_at) {
                return true;
            }
            table.account_traffic(record);
            false
        });
        before - self.connections.len()
    }

    /// Count every record whose duration is still being tracked as one open
    /// connection under its key.
    pub fn sample_open(&self, table: &mut AccountingTable) -> usize {
        let mut open = 0;
        for record in self.connections.values() {
            if !record.tracking_disabled {
                table.account_open(record.key);
                open += 1;
            }
        }
        open
    }

    pub fn get(&self, id: FlowId) -> Option<&ConnectionRecord> {
        self.connections.get(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
