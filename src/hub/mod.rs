//! Envelope fan-out to connected observer sessions.

pub mod queue;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::feed::NotificationEnvelope;

pub use queue::{Enqueue, SessionId, SessionQueue, SessionState};

/// Result of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Sessions the envelope was queued on.
    pub recipients: usize,
    /// Recipients that had to evict an older envelope to make room.
    pub overflowed: usize,
}

/// Registry of attached sessions.
///
/// The hub holds only weak references: sessions are owned by the
/// [`SessionManager`](crate::session::SessionManager), and a session dropped
/// there simply disappears from fan-out on the next publish.
#[derive(Default)]
pub struct BroadcastHub {
    sessions: DashMap<SessionId, Weak<SessionQueue>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for fan-out.
    pub fn attach(&self, session: &Arc<SessionQueue>) {
        self.sessions.insert(session.id(), Arc::downgrade(session));
        debug!(session_id = %session.id(), sessions = self.sessions.len(), "session attached");
    }

    /// Unregister a session. Unknown ids and repeated calls are no-ops.
    pub fn detach(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!(session_id = %id, sessions = self.sessions.len(), "session detached");
        }
        removed
    }

    /// Queue `envelope` on every attached session. Never waits on a session's
    /// transport; a full queue drops its oldest entry instead.
    pub fn publish(&self, envelope: NotificationEnvelope) -> PublishReport {
        let envelope = Arc::new(envelope);
        let mut report = PublishReport::default();
        let mut stale = Vec::new();

        for entry in self.sessions.iter() {
            let Some(session) = entry.value().upgrade() else {
                stale.push(*entry.key());
                continue;
            };
            match session.push(Arc::clone(&envelope)) {
                Enqueue::Queued => report.recipients += 1,
                Enqueue::Overflowed => {
                    report.recipients += 1;
                    report.overflowed += 1;
                    warn!(
                        session_id = %session.id(),
                        capacity = session.capacity(),
                        "session queue full, dropped oldest update"
                    );
                }
                Enqueue::Rejected => stale.push(*entry.key()),
            }
        }

        for id in stale {
            self.sessions.remove_if(&id, |_, weak| {
                weak.upgrade().map_or(true, |session| !session.accepts())
            });
        }

        debug!(
            operation = %envelope.operation(),
            recipients = report.recipients,
            overflowed = report.overflowed,
            "envelope published"
        );
        report
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_attached(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }
}
