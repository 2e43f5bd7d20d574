pub mod aggregated;

pub use aggregated::{AggregatedSink, FlushStats};
