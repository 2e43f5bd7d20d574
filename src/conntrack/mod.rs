pub mod event;
pub mod parse;
pub mod stats;
pub mod sysctl;
pub mod tool;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::event::{Flow, FlowEvent};
use self::stats::EventStats;

/// Receiving ends of a live event subscription.
///
/// `errors` yields at most one value: the transport failure that ended the
/// stream. Anything arriving there is fatal to the caller.
pub struct EventStream {
    pub events: mpsc::Receiver<FlowEvent>,
    pub errors: mpsc::Receiver<anyhow::Error>,
}

/// FlowSource supplies conntrack lifecycle events and full-table dumps.
pub trait FlowSource: Send + Sync + 'static {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Start delivering live events. Background work stops when `ctx` is
    /// cancelled. Every decoded event and every rejected line is counted in
    /// `stats`.
    fn subscribe(&self, ctx: CancellationToken, stats: Arc<EventStats>) -> Result<EventStream>;

    /// Fetch the complete current conntrack table.
    fn dump(&self) -> impl std::future::Future<Output = Result<Vec<Flow>>> + Send;
}
