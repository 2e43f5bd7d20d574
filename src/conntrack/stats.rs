use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{EventType, MAX_EVENT_TYPE};

/// Lock-free counters for the event path.
///
/// The reader task records every decoded event and every unparseable line;
/// the event loop records the events that passed the flow filter.
/// `snapshot()` reads and resets everything at once, so each call reports
/// the activity since the previous one.
pub struct EventStats {
    received: [AtomicU64; MAX_EVENT_TYPE + 1],
    interesting: AtomicU64,
    parse_errors: AtomicU64,
}

/// Point-in-time view returned by [`EventStats::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStatsSnapshot {
    pub received: Vec<(EventType, u64)>,
    pub interesting: u64,
    pub parse_errors: u64,
}

impl EventStatsSnapshot {
    pub fn total_received(&self) -> u64 {
        self.received.iter().map(|(_, n)| n).sum()
    }
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            received: std::array::from_fn(|_| AtomicU64::new(0)),
            interesting: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    /// Count one decoded event of the given type.
    pub fn record(&self, t: EventType) {
        if let Some(counter) = self.received.get(t as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one event accepted by the flow filter.
    pub fn record_interesting(&self) {
        self.interesting.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one line the parser rejected.
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters. Event types with a zero count
    /// are omitted.
    pub fn snapshot(&self) -> EventStatsSnapshot {
        let mut received = Vec::with_capacity(MAX_EVENT_TYPE + 1);

        for (i, counter) in self.received.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(et) = EventType::from_u8(i as u8) {
                    received.push((et, v));
                }
            }
        }

        EventStatsSnapshot {
            received,
            interesting: self.interesting.swap(0, Ordering::Relaxed),
            parse_errors: self.parse_errors.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}
