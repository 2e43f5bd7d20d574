use crate::conntrack::event::Counters;

/// Per-key totals for one output interval.
///
/// Traffic fields hold deltas, never cumulative kernel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateEntry {
    pub packets_src_to_dst: u64,
    pub packets_dst_to_src: u64,
    pub bytes_src_to_dst: u64,
    pub bytes_dst_to_src: u64,
    /// Connections whose close was accounted during the interval.
    pub connections_closed: u64,
    /// Sum of the lifetimes of those connections, in milliseconds.
    pub connection_time_ms: u64,
    /// Connections sampled as open at the interval boundary.
    pub open_connections: u64,
}

impl AggregateEntry {
    /// Add traffic deltas for both directions.
    pub fn add_traffic(&mut self, src_to_dst: Counters, dst_to_src: Counters) {
        self.packets_src_to_dst += src_to_dst.packets;
        self.bytes_src_to_dst += src_to_dst.bytes;
        self.packets_dst_to_src += dst_to_src.packets;
        self.bytes_dst_to_src += dst_to_src.bytes;
    }

    /// Record one finished connection.
    pub fn add_close(&mut self, duration_ms: u64) {
        self.connections_closed += 1;
        self.connection_time_ms += duration_ms;
    }

    pub fn add_open(&mut self) {
        self.open_connections += 1;
    }
}
