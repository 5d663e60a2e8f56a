use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::db::Database;
use crate::feed::{ChangeFeed, ChangeStream, RawChange};

const BATCH_SIZE: usize = 256;

/// Highest change-log seq the feed has read. Compaction must not remove rows
/// above it.
#[derive(Debug, Clone, Default)]
pub struct ChangeLogCursor(Arc<AtomicI64>);

impl ChangeLogCursor {
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    fn advance(&self, seq: i64) {
        self.0.fetch_max(seq, Ordering::AcqRel);
    }
}

/// Change feed backed by the `change_log` table.
///
/// Each subscription starts at the log's current head and polls for newer
/// rows. Any process writing through [`Database`] is observed, not only this one.
pub struct SqliteChangeFeed {
    db: Arc<Database>,
    poll_interval: Duration,
    consumed: ChangeLogCursor,
}

impl SqliteChangeFeed {
    pub fn new(db: Arc<Database>, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval,
            consumed: ChangeLogCursor::default(),
        }
    }

    /// Shared handle on the read position, for bounding compaction.
    pub fn consumed(&self) -> ChangeLogCursor {
        self.consumed.clone()
    }
}

struct Poller {
    db: Arc<Database>,
    cursor: i64,
    consumed: ChangeLogCursor,
    poll_interval: Duration,
    buffered: VecDeque<RawChange>,
    failed: bool,
}

impl Poller {
    async fn fetch(&mut self) -> Result<()> {
        let db = self.db.clone();
        let cursor = self.cursor;
        let rows = tokio::task::spawn_blocking(move || db.changes_since(cursor, BATCH_SIZE))
            .await
            .map_err(|err| anyhow!("failed to join database task: {err}"))??;

        if let Some((seq, _)) = rows.last() {
            self.cursor = *seq;
            self.consumed.advance(*seq);
        }
        self.buffered.extend(rows.into_iter().map(|(_, change)| change));
        Ok(())
    }

    async fn next(mut self) -> Option<(Result<RawChange>, Self)> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(change) = self.buffered.pop_front() {
                return Some((Ok(change), self));
            }
            sleep(self.poll_interval).await;
            if let Err(err) = self.fetch().await {
                self.failed = true;
                return Some((Err(err), self));
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for SqliteChangeFeed {
    async fn subscribe(&self) -> Result<ChangeStream> {
        let db = self.db.clone();
        let head = tokio::task::spawn_blocking(move || db.change_log_head())
            .await
            .map_err(|err| anyhow!("failed to join database task: {err}"))??;
        debug!(cursor = head, "change log subscription opened");
        self.consumed.advance(head);

        let poller = Poller {
            db: self.db.clone(),
            cursor: head,
            consumed: self.consumed.clone(),
            poll_interval: self.poll_interval,
            buffered: VecDeque::new(),
            failed: false,
        };
        Ok(stream::unfold(poller, Poller::next).boxed())
    }
}
