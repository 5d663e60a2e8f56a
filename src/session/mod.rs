//! Observer onboarding: snapshot first, then live updates.
//!
//! A new session is attached to the hub *before* the snapshot is fetched, so
//! anything published while the fetch is in flight waits in the session's
//! queue and is delivered right after the snapshot. The same delivery task
//! sends the snapshot and then drains the queue, which is what orders the two.

pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::hub::{BroadcastHub, SessionId, SessionQueue, SessionState};

pub use transport::{ServerMessage, Transport};

/// Read side of the store used for initial snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Up to `limit` most recently updated records, most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub snapshot_limit: usize,
    pub snapshot_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            snapshot_limit: 10,
            snapshot_timeout: Duration::from_secs(5),
            queue_capacity: 256,
        }
    }
}

struct SessionEntry {
    queue: Arc<SessionQueue>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    hub: Arc<BroadcastHub>,
    snapshots: Arc<dyn SnapshotSource>,
    options: SessionOptions,
    sessions: DashMap<SessionId, SessionEntry>,
}

/// Owns every observer session and its transport.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        hub: Arc<BroadcastHub>,
        snapshots: Arc<dyn SnapshotSource>,
        options: SessionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub,
                snapshots,
                options,
                sessions: DashMap::new(),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.inner.hub
    }

    /// Register a new observer and start its delivery task.
    pub fn on_connect<T: Transport>(&self, transport: T) -> SessionId {
        let id = SessionId::new();
        let queue = Arc::new(SessionQueue::new(id, self.inner.options.queue_capacity));

        self.inner.sessions.insert(
            id,
            SessionEntry {
                queue: Arc::clone(&queue),
                task: None,
            },
        );
        self.inner.hub.attach(&queue);

        let task = tokio::spawn(self.clone().deliver(queue, transport));
        match self.inner.sessions.get_mut(&id) {
            Some(mut entry) => entry.task = Some(task),
            // Already gone: the transport failed before we got here.
            None => drop(task),
        }

        info!(session_id = %id, sessions = self.active_sessions(), "observer connected");
        id
    }

    /// Detach the session and release its transport. Safe to repeat.
    pub fn on_disconnect(&self, id: &SessionId) {
        self.inner.hub.detach(id);
        let Some((_, entry)) = self.inner.sessions.remove(id) else {
            return;
        };

        entry.queue.begin_close();
        if let Some(task) = entry.task {
            task.abort();
        }
        entry.queue.mark_closed();
        info!(session_id = %id, sessions = self.active_sessions(), "observer disconnected");
    }

    pub fn session_state(&self, id: &SessionId) -> Option<SessionState> {
        self.inner.sessions.get(id).map(|entry| entry.queue.state())
    }

    pub fn session_queue(&self, id: &SessionId) -> Option<Arc<SessionQueue>> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| Arc::clone(&entry.queue))
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Disconnect every session, used on server shutdown.
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.on_disconnect(&id);
        }
    }

    async fn load_snapshot(&self, id: SessionId) -> ServerMessage {
        let options = &self.inner.options;
        let fetch = self.inner.snapshots.recent(options.snapshot_limit);

        match timeout(options.snapshot_timeout, fetch).await {
            Ok(Ok(records)) => {
                debug!(session_id = %id, records = records.len(), "snapshot loaded");
                ServerMessage::InitialOrders(records)
            }
            Ok(Err(err)) => {
                warn!(session_id = %id, error = %err, "failed to load snapshot");
                ServerMessage::SnapshotError {
                    message: format!("failed to load recent orders: {err}"),
                }
            }
            Err(_) => {
                warn!(
                    session_id = %id,
                    timeout_ms = options.snapshot_timeout.as_millis() as u64,
                    "snapshot timed out"
                );
                ServerMessage::SnapshotError {
                    message: "timed out loading recent orders".to_string(),
                }
            }
        }
    }

    async fn deliver<T: Transport>(self, queue: Arc<SessionQueue>, mut transport: T) {
        let id = queue.id();

        let snapshot = self.load_snapshot(id).await;
        if let Err(err) = transport.send(snapshot).await {
            self.fail(&queue, &mut transport, err).await;
            return;
        }
        queue.mark_live();
        debug!(session_id = %id, "session live");

        while let Some(envelope) = queue.pop().await {
            if let Some(dropped) = queue.take_gap() {
                warn!(session_id = %id, dropped, "observer fell behind, updates dropped");
                if let Err(err) = transport.send(ServerMessage::Gap { dropped }).await {
                    self.fail(&queue, &mut transport, err).await;
                    return;
                }
            }
            if let Err(err) = transport.send(ServerMessage::OrderUpdate(envelope)).await {
                self.fail(&queue, &mut transport, err).await;
                return;
            }
        }

        transport.close().await;
        debug!(session_id = %id, "delivery loop finished");
    }

    /// Transport write failed: close this session only.
    async fn fail<T: Transport>(&self, queue: &SessionQueue, transport: &mut T, err: anyhow::Error) {
        let id = queue.id();
        warn!(session_id = %id, error = %err, "transport write failed, closing session");

        queue.begin_close();
        self.inner.hub.detach(&id);
        self.inner.sessions.remove(&id);
        transport.close().await;
        queue.mark_closed();
    }
}
