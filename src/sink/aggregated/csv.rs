use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use super::aggregate::AggregateEntry;
use super::dimension::AggregationKey;

/// Nanoseconds since the Unix epoch; times before the epoch map to zero.
pub fn unix_nanos(timestamp: SystemTime) -> u128 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Append one output line for `entry`.
///
/// Columns: interval timestamp (ns), protocol, masked source, masked
/// destination, port or -1, packets src->dst, packets dst->src, bytes
/// src->dst, bytes dst->src, closed connections, summed duration (ms) and,
/// when `include_open` is set, the open-connection sample.
pub fn write_row(
    out: &mut String,
    timestamp_nanos: u128,
    key: &AggregationKey,
    entry: &AggregateEntry,
    include_open: bool,
) -> std::fmt::Result {
    write!(
        out,
        "{timestamp_nanos},{key},{},{},{},{},{},{}",
        entry.packets_src_to_dst,
        entry.packets_dst_to_src,
        entry.bytes_src_to_dst,
        entry.bytes_dst_to_src,
        entry.connections_closed,
        entry.connection_time_ms,
    )?;

    if include_open {
        write!(out, ",{}", entry.open_connections)?;
    }

    out.push('\n');
    Ok(())
}
