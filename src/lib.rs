//! # Orderfeed - Real-Time Order Change Relay
//!
//! Watches the order store's change log and fans every committed mutation out
//! to connected WebSocket observers.
//!
//! ## Features
//!
//! - **Snapshot then live**: a new observer gets the most recent orders first,
//!   then every change committed after it attached, with nothing lost in between
//! - **Isolated fan-out**: each observer has its own bounded queue; a stalled
//!   one drops its oldest updates and is told so with a `gap` message
//! - **Self-healing feed**: the watcher resubscribes with capped exponential
//!   backoff and never gives up
//! - **Cross-process**: mutations made by any process against the same
//!   database are observed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use orderfeed::{server, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::from_env()?;
//!     server::serve(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod feed;
pub mod hub;
pub mod model;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

// Re-export main types for library consumers
pub use config::RelayConfig;
pub use error::{BackoffPolicy, RelayError};
pub use feed::{ChangeFeed, ChangeFeedWatcher, NotificationEnvelope, OperationKind, RawChange};
pub use hub::BroadcastHub;
pub use session::{ServerMessage, SessionManager, SnapshotSource, Transport};
pub use storage::{Database, OrderStore, SqliteChangeFeed};
pub use sync::LocalView;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
