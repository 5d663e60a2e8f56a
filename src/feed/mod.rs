pub mod envelope;
pub mod watcher;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use envelope::{NormalizeError, NotificationEnvelope, OperationKind, RawChange};
pub use watcher::{ChangeFeedWatcher, WatcherState, WatcherStatus};

/// Stream of raw change events. An `Err` item or the end of the stream means
/// the subscription is no longer healthy.
pub type ChangeStream = BoxStream<'static, Result<RawChange>>;

/// A store that can report its mutations as an ordered stream
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// Open a subscription positioned at the store's current head. Events
    /// committed before this call are not replayed.
    async fn subscribe(&self) -> Result<ChangeStream>;
}
