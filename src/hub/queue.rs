use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::feed::NotificationEnvelope;

/// Opaque identifier of one observer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Attaching = 0,
    Live = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Attaching,
            1 => SessionState::Live,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Outcome of offering an envelope to a session queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queued after evicting the oldest pending envelope.
    Overflowed,
    /// The session is closing or closed.
    Rejected,
}

/// Bounded outbound queue of one session.
///
/// Written by the hub, drained by the session's delivery task. When full, the
/// oldest pending envelope is evicted and the gap flag is raised. The lock is
/// only held for the push/pop itself, never across an await.
pub struct SessionQueue {
    id: SessionId,
    capacity: usize,
    pending: Mutex<VecDeque<Arc<NotificationEnvelope>>>,
    state: AtomicU8,
    gap: AtomicBool,
    dropped: AtomicU64,
    ready: Notify,
}

impl SessionQueue {
    pub fn new(id: SessionId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            capacity,
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            state: AtomicU8::new(SessionState::Attaching as u8),
            gap: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            ready: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the hub should still deliver to this session.
    pub fn accepts(&self) -> bool {
        matches!(self.state(), SessionState::Attaching | SessionState::Live)
    }

    pub fn push(&self, envelope: Arc<NotificationEnvelope>) -> Enqueue {
        if !self.accepts() {
            return Enqueue::Rejected;
        }

        let overflowed = {
            let mut pending = self.pending.lock();
            let evicted = pending.len() >= self.capacity && pending.pop_front().is_some();
            if evicted {
                self.dropped.fetch_add(1, Ordering::AcqRel);
                self.gap.store(true, Ordering::Release);
            }
            pending.push_back(envelope);
            evicted
        };
        self.ready.notify_one();

        if overflowed {
            Enqueue::Overflowed
        } else {
            Enqueue::Queued
        }
    }

    pub fn try_pop(&self) -> Option<Arc<NotificationEnvelope>> {
        self.pending.lock().pop_front()
    }

    /// Wait for the next envelope. Returns `None` once the session is closing.
    pub async fn pop(&self) -> Option<Arc<NotificationEnvelope>> {
        loop {
            if !self.accepts() {
                return None;
            }
            if let Some(envelope) = self.try_pop() {
                return Some(envelope);
            }
            self.ready.notified().await;
        }
    }

    pub fn has_gap(&self) -> bool {
        self.gap.load(Ordering::Acquire)
    }

    /// Clear the gap flag, returning how many envelopes were dropped since it
    /// was last taken.
    pub fn take_gap(&self) -> Option<u64> {
        let _pending = self.pending.lock();
        if self.gap.swap(false, Ordering::AcqRel) {
            Some(self.dropped.swap(0, Ordering::AcqRel))
        } else {
            None
        }
    }

    /// `attaching` -> `live`. Returns false if the session already left `attaching`.
    pub fn mark_live(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Attaching as u8,
                SessionState::Live as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `closing` and wake the delivery task. Returns false if the
    /// session was already closing or closed.
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.ready.notify_one();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Final state; releases anything still pending.
    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.pending.lock().clear();
        self.ready.notify_one();
    }
}

impl fmt::Debug for SessionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionQueue")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("gap", &self.has_gap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn envelope(n: u64) -> Arc<NotificationEnvelope> {
        Arc::new(NotificationEnvelope::insert(json!({ "id": n.to_string() })))
    }

    #[test]
    fn overflow_drops_oldest_and_raises_gap() {
        let queue = SessionQueue::new(SessionId::new(), 4);

        for n in 0..10 {
            queue.push(envelope(n));
            assert!(queue.len() <= queue.capacity());
        }

        assert!(queue.has_gap());
        let remaining: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.key().unwrap().to_string())
            .collect();
        assert_eq!(remaining, vec!["6", "7", "8", "9"]);

        assert_eq!(queue.take_gap(), Some(6));
        assert_eq!(queue.take_gap(), None);
        assert!(!queue.has_gap());
    }

    #[test]
    fn no_gap_below_capacity() {
        let queue = SessionQueue::new(SessionId::new(), 4);
        for n in 0..4 {
            assert_eq!(queue.push(envelope(n)), Enqueue::Queued);
        }
        assert!(!queue.has_gap());
        assert_eq!(queue.push(envelope(4)), Enqueue::Overflowed);
        assert!(queue.has_gap());
    }

    #[test]
    fn gap_is_visible_before_the_envelope_that_follows_it() {
        const TOTAL: u64 = 20_000;
        let queue = Arc::new(SessionQueue::new(SessionId::new(), 2));

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for n in 0..TOTAL {
                    queue.push(envelope(n));
                }
            })
        };

        let mut delivered = 0u64;
        let mut reported = 0u64;
        loop {
            let Some(next) = queue.try_pop() else {
                if producer.is_finished() && queue.is_empty() {
                    break;
                }
                std::thread::yield_now();
                continue;
            };
            if let Some(dropped) = queue.take_gap() {
                assert!(dropped > 0, "gap announced with nothing dropped");
                reported += dropped;
            }
            // Every envelope older than `n` was delivered or already reported.
            let n: u64 = next.key().unwrap().parse().unwrap();
            assert!(n - delivered <= reported, "envelope {n} delivered ahead of its gap");
            delivered += 1;
        }
        producer.join().unwrap();
        reported += queue.take_gap().unwrap_or(0);

        assert_eq!(delivered + reported, TOTAL);
    }

    #[test]
    fn closing_session_rejects_envelopes() {
        let queue = SessionQueue::new(SessionId::new(), 4);
        assert!(queue.begin_close());
        assert!(!queue.begin_close());
        assert_eq!(queue.push(envelope(1)), Enqueue::Rejected);
        assert_eq!(queue.state(), SessionState::Closing);

        queue.mark_closed();
        assert_eq!(queue.state(), SessionState::Closed);
        assert!(!queue.mark_live());
    }

    #[test]
    fn state_transitions() {
        let queue = SessionQueue::new(SessionId::new(), 1);
        assert_eq!(queue.state(), SessionState::Attaching);
        assert!(queue.mark_live());
        assert!(!queue.mark_live());
        assert_eq!(queue.state(), SessionState::Live);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(SessionQueue::new(SessionId::new(), 8));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(envelope(42));

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.key(), Some("42"));
    }

    #[tokio::test]
    async fn pop_returns_none_after_close() {
        let queue = Arc::new(SessionQueue::new(SessionId::new(), 8));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.begin_close();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }
}
