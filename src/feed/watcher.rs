//! Change-feed watcher
//!
//! Keeps exactly one subscription to the store's change feed alive for the
//! lifetime of the process. Raw events are normalized into envelopes and handed
//! to the [`BroadcastHub`]; a failed or closed feed is resubscribed from the
//! store's current position after an exponential backoff that never gives up.
//!
//! All state transitions happen inside one control loop. The loop owns the only
//! `watch::Sender` for [`WatcherState`]; everyone else gets a receiver.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{ChangeFeed, NormalizeError, NotificationEnvelope, RawChange};
use crate::error::{Backoff, BackoffPolicy};
use crate::hub::BroadcastHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    Disconnected,
    Connecting,
    Watching,
    Erroring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherState {
    pub status: WatcherStatus,
    /// Consecutive failed attempts since the feed last made progress.
    pub retry_count: u32,
    pub next_retry_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl Default for WatcherState {
    fn default() -> Self {
        Self {
            status: WatcherStatus::Disconnected,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }
}

pub struct ChangeFeedWatcher {
    feed: Arc<dyn ChangeFeed>,
    hub: Arc<BroadcastHub>,
    policy: BackoffPolicy,
    state_tx: Mutex<Option<watch::Sender<WatcherState>>>,
    state_rx: watch::Receiver<WatcherState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeFeedWatcher {
    pub fn new(feed: Arc<dyn ChangeFeed>, hub: Arc<BroadcastHub>, policy: BackoffPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(WatcherState::default());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            feed,
            hub,
            policy,
            state_tx: Mutex::new(Some(state_tx)),
            state_rx,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawn the control loop. Only the first call does anything; later calls
    /// return `false`.
    pub fn start(&self) -> bool {
        let Some(state) = self.state_tx.lock().take() else {
            debug!("change feed watcher already started");
            return false;
        };

        let control = ControlLoop {
            feed: Arc::clone(&self.feed),
            hub: Arc::clone(&self.hub),
            backoff: self.policy.backoff(),
            max_delay: self.policy.max_delay,
            state,
        };
        let shutdown = self.shutdown_tx.subscribe();
        *self.task.lock() = Some(tokio::spawn(control.run(shutdown)));
        true
    }

    /// Stop the loop, dropping the active subscription, and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "change feed watcher task ended abnormally");
            }
        }
    }

    pub fn status(&self) -> WatcherStatus {
        self.state_rx.borrow().status
    }

    pub fn state(&self) -> WatcherState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state_rx.clone()
    }
}

impl Drop for ChangeFeedWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

enum FeedEnd {
    Closed,
    Failed(Error),
}

struct ControlLoop {
    feed: Arc<dyn ChangeFeed>,
    hub: Arc<BroadcastHub>,
    backoff: Backoff,
    max_delay: Duration,
    state: watch::Sender<WatcherState>,
}

impl ControlLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("change feed watcher started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.state.send_modify(|s| {
                s.status = WatcherStatus::Connecting;
                s.next_retry_at = None;
            });

            let (end, progressed) = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                outcome = self.watch_once() => outcome,
            };

            if progressed {
                self.backoff.reset();
            }
            // Unbounded policy: `None` only if a caller configured max_attempts.
            let delay = self.backoff.next_delay().unwrap_or(self.max_delay);
            let retry_count = self.backoff.attempts();
            let next_retry_at = Instant::now() + delay;

            match &end {
                FeedEnd::Closed => {
                    warn!(
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "change feed closed, resubscribing"
                    );
                }
                FeedEnd::Failed(err) => {
                    warn!(
                        error = %err,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "change feed error, resubscribing"
                    );
                }
            }

            self.state.send_modify(|s| {
                s.status = match &end {
                    FeedEnd::Closed => WatcherStatus::Disconnected,
                    FeedEnd::Failed(_) => WatcherStatus::Erroring,
                };
                s.retry_count = retry_count;
                s.next_retry_at = Some(next_retry_at);
                s.last_error = match &end {
                    FeedEnd::Closed => Some("change feed closed".to_string()),
                    FeedEnd::Failed(err) => Some(format!("{err:#}")),
                };
            });

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        self.state.send_modify(|s| {
            s.status = WatcherStatus::Disconnected;
            s.next_retry_at = None;
        });
        info!("change feed watcher stopped");
    }

    /// One subscription lifetime. Returns how it ended and whether any event
    /// arrived before it did.
    async fn watch_once(&mut self) -> (FeedEnd, bool) {
        let mut stream = match self.feed.subscribe().await {
            Ok(stream) => stream,
            Err(err) => return (FeedEnd::Failed(err), false),
        };

        self.state.send_modify(|s| {
            s.status = WatcherStatus::Watching;
            s.next_retry_at = None;
        });
        info!(retry = self.backoff.attempts(), "subscribed to change feed");

        let mut progressed = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => {
                    if !progressed {
                        progressed = true;
                        self.state.send_modify(|s| {
                            s.retry_count = 0;
                            s.last_error = None;
                        });
                    }
                    self.dispatch(raw);
                }
                Err(err) => return (FeedEnd::Failed(err), progressed),
            }
        }
        (FeedEnd::Closed, progressed)
    }

    fn dispatch(&self, raw: RawChange) {
        match NotificationEnvelope::from_raw(raw) {
            Ok(envelope) => {
                let operation = envelope.operation();
                let report = self.hub.publish(envelope);
                debug!(
                    %operation,
                    recipients = report.recipients,
                    "change broadcast"
                );
            }
            Err(NormalizeError::UnrecognizedOperation(operation)) => {
                warn!(%operation, "unrecognized change operation, event dropped");
            }
            Err(err) => {
                warn!(error = %err, "malformed change event, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ChangeStream, OperationKind};
    use crate::hub::{SessionId, SessionQueue};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;

    enum Script {
        Fail,
        Events(Vec<anyhow::Result<RawChange>>),
    }

    /// Replays one script entry per subscription; once exhausted, subscriptions
    /// stay open without events.
    #[derive(Default)]
    struct ScriptedFeed {
        scripts: Mutex<VecDeque<Script>>,
        subscribed_at: Mutex<Vec<Instant>>,
    }

    impl ScriptedFeed {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                subscribed_at: Mutex::new(Vec::new()),
            })
        }

        fn subscriptions(&self) -> Vec<Instant> {
            self.subscribed_at.lock().clone()
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn subscribe(&self) -> anyhow::Result<ChangeStream> {
            self.subscribed_at.lock().push(Instant::now());
            match self.scripts.lock().pop_front() {
                Some(Script::Fail) => Err(anyhow!("store unreachable")),
                Some(Script::Events(events)) => Ok(stream::iter(events).boxed()),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn watcher(feed: Arc<ScriptedFeed>) -> (ChangeFeedWatcher, Arc<SessionQueue>) {
        let hub = Arc::new(BroadcastHub::new());
        let session = Arc::new(SessionQueue::new(SessionId::new(), 128));
        hub.attach(&session);
        let policy = BackoffPolicy::unbounded(Duration::from_secs(2), Duration::from_secs(30));
        (ChangeFeedWatcher::new(feed, hub, policy), session)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200_000 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn drain(session: &SessionQueue) -> Vec<Arc<NotificationEnvelope>> {
        std::iter::from_fn(|| session.try_pop()).collect()
    }

    #[tokio::test]
    async fn publishes_in_feed_order_and_drops_unknown_operations() {
        let feed = ScriptedFeed::new(vec![Script::Events(vec![
            Ok(RawChange::insert(json!({"id": "A1", "status": "pending"}))),
            Ok(RawChange::new("drop")),
            Ok(RawChange::new("insert")),
            Ok(RawChange::update(
                json!({"id": "A1", "status": "shipped"}),
                Some(json!({"id": "A1", "status": "pending"})),
            )),
            Ok(RawChange::delete(json!({"id": "A1"}))),
        ])]);
        let (watcher, session) = watcher(feed);
        assert!(watcher.start());

        wait_for(|| session.len() >= 3).await;
        let ops: Vec<OperationKind> = drain(&session).iter().map(|e| e.operation()).collect();
        assert_eq!(
            ops,
            vec![OperationKind::Insert, OperationKind::Update, OperationKind::Delete]
        );

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let feed = ScriptedFeed::new(vec![]);
        let (watcher, _session) = watcher(feed.clone());

        assert!(watcher.start());
        assert!(!watcher.start());
        wait_for(|| watcher.status() == WatcherStatus::Watching).await;
        assert!(!watcher.start());

        sleep(Duration::from_millis(50)).await;
        assert_eq!(feed.subscriptions().len(), 1);

        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_growing_delay_until_feed_recovers() {
        let feed = ScriptedFeed::new(vec![
            Script::Fail,
            Script::Fail,
            Script::Events(vec![Err(anyhow!("cursor killed"))]),
            Script::Events(vec![]),
            Script::Events(vec![Ok(RawChange::insert(json!({"id": "B7"})))]),
        ]);
        let (watcher, session) = watcher(feed.clone());
        watcher.start();

        wait_for(|| !session.is_empty()).await;
        assert_eq!(drain(&session)[0].key(), Some("B7"));

        let at = feed.subscriptions();
        assert!(at.len() >= 5);
        let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).take(4).collect();
        let expected = [2, 4, 8, 16].map(Duration::from_secs);
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(*gap >= want, "gap {gap:?} shorter than {want:?}");
        }
        for pair in gaps.windows(2) {
            assert!(pair[0] <= pair[1]);
        }

        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn never_gives_up_and_caps_delay() {
        let feed = ScriptedFeed::new((0..40).map(|_| Script::Fail).collect());
        let (watcher, _session) = watcher(feed.clone());
        watcher.start();

        wait_for(|| feed.subscriptions().len() >= 30).await;

        let state = watcher.state();
        assert!(state.retry_count >= 29);
        assert!(state.last_error.as_deref().unwrap().contains("store unreachable"));

        let at = feed.subscriptions();
        let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[0] <= pair[1] + Duration::from_millis(20));
        }
        assert!(gaps.iter().all(|g| *g < Duration::from_secs(31)));

        watcher.shutdown().await;
        assert_eq!(watcher.status(), WatcherStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_backoff() {
        let feed = ScriptedFeed::new(vec![
            Script::Fail,
            Script::Fail,
            Script::Events(vec![Ok(RawChange::insert(json!({"id": "C1"})))]),
            Script::Events(vec![Ok(RawChange::insert(json!({"id": "C2"})))]),
        ]);
        let (watcher, session) = watcher(feed.clone());
        watcher.start();

        wait_for(|| session.len() >= 2).await;
        wait_for(|| feed.subscriptions().len() >= 5).await;

        let at = feed.subscriptions();
        let after_progress = at[3] - at[2];
        assert!(after_progress >= Duration::from_secs(2));
        assert!(after_progress < Duration::from_secs(4));

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let feed = ScriptedFeed::new(vec![]);
        let (watcher, _session) = watcher(feed.clone());
        watcher.start();
        wait_for(|| watcher.status() == WatcherStatus::Watching).await;

        watcher.shutdown().await;
        assert_eq!(watcher.status(), WatcherStatus::Disconnected);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(feed.subscriptions().len(), 1);
        assert!(!watcher.start());
    }
}
