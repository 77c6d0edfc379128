use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use saga_types::events::{Change, ChangeEvent};
use saga_types::store::StoreResult;

use crate::mirror::{Applied, Mirror, Record};

/// Full read of one scope from the store.
pub type Loader<R> = Box<dyn Fn() -> BoxFuture<'static, StoreResult<Vec<R>>> + Send + Sync>;

/// A [`Mirror`] shared between the channel handler and its readers.
///
/// Every change is published as a snapshot on a watch channel. Missed
/// updates schedule a background re-fetch, at most one at a time.
pub struct Feed<R: Record> {
    label: String,
    mirror: Mutex<Mirror<R>>,
    snapshot: watch::Sender<Vec<R>>,
    visible: fn(&R) -> bool,
    loader: Loader<R>,
    refetching: AtomicBool,
}

fn always<R>(_: &R) -> bool {
    true
}

impl<R: Record + DeserializeOwned> Feed<R> {
    pub fn new(label: impl Into<String>, mirror: Mirror<R>, loader: Loader<R>) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            label: label.into(),
            mirror: Mutex::new(mirror),
            snapshot,
            visible: always::<R>,
            loader,
            refetching: AtomicBool::new(false),
        }
    }

    /// Hide rows from every read and snapshot without removing them.
    pub fn filtered(mut self, visible: fn(&R) -> bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rows(&self) -> Vec<R> {
        self.lock().rows().iter().filter(|row| (self.visible)(row)).cloned().collect()
    }

    pub fn get(&self, key: &R::Key) -> Option<R> {
        self.lock().get(key).filter(|row| (self.visible)(row)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().rows().iter().filter(|row| (self.visible)(row)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row count including rows the filter hides.
    pub fn stored(&self) -> usize {
        self.lock().len()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<R>> {
        self.snapshot.subscribe()
    }

    pub fn apply(&self, change: Change<R>) -> Applied {
        let applied = self.lock().apply(change);
        if applied.changed() {
            self.publish();
        }
        applied
    }

    pub fn upsert(&self, row: R) -> Applied {
        let applied = self.lock().upsert(row);
        self.publish();
        applied
    }

    pub fn remove(&self, key: &R::Key) -> Option<R> {
        let removed = self.lock().remove(key);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    pub fn retain(&self, keep: impl FnMut(&R) -> bool) -> usize {
        let dropped = self.lock().retain(keep);
        if dropped > 0 {
            self.publish();
        }
        dropped
    }

    /// Replace the mirror with a full read of the scope.
    pub async fn reload(&self) -> StoreResult<usize> {
        let rows = (self.loader)().await?;
        let count = {
            let mut mirror = self.lock();
            mirror.replace_all(rows);
            mirror.len()
        };
        self.publish();
        debug!("{} reloaded with {} rows", self.label, count);
        Ok(count)
    }

    /// Decode and apply one change notification. Returns `None` when the
    /// payload does not decode as this feed's row type.
    pub fn ingest(self: &Arc<Self>, event: &ChangeEvent) -> Option<Applied> {
        let change = match event.decode::<R>() {
            Ok(change) => change,
            Err(e) => {
                warn!("{}: dropping undecodable {} change: {}", self.label, event.table, e);
                return None;
            }
        };
        let applied = self.apply(change);
        match applied {
            Applied::Gap => {
                warn!("{}: update for a row never seen, re-fetching", self.label);
                self.refetch_in_background();
            }
            Applied::Duplicate => debug!("{}: ignoring replayed insert", self.label),
            _ => {}
        }
        Some(applied)
    }

    /// Spawn a reload unless one is already running. Returns whether one
    /// was started.
    pub fn refetch_in_background(self: &Arc<Self>) -> bool {
        if self.refetching.swap(true, Ordering::AcqRel) {
            debug!("{}: re-fetch already in flight", self.label);
            return false;
        }
        let feed = self.clone();
        tokio::spawn(async move {
            match feed.reload().await {
                Ok(count) => info!("{}: re-fetched {} rows", feed.label, count),
                Err(e) => warn!("{}: re-fetch failed: {}", feed.label, e),
            }
            feed.refetching.store(false, Ordering::Release);
        });
        true
    }

    pub fn is_refetching(&self) -> bool {
        self.refetching.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Mirror<R>> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        let rows = self.rows();
        self.snapshot.send_replace(rows);
    }
}

/// Loader for tests that never hit a store.
#[cfg(test)]
pub(crate) fn fixed<R: Record>(rows: Vec<R>) -> Loader<R> {
    use futures_util::FutureExt;

    Box::new(move || {
        let rows = rows.clone();
        async move { Ok::<_, saga_types::store::StoreError>(rows) }.boxed()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use saga_types::events::Table;
    use saga_types::models::ReadStatus;
    use uuid::Uuid;

    use super::*;

    fn status(campaign_id: Uuid, last: i64) -> ReadStatus {
        ReadStatus {
            user_id: Uuid::nil(),
            campaign_id,
            last_read_message_id: last,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshots_follow_changes() {
        let campaign = Uuid::new_v4();
        let feed = Arc::new(Feed::new("read status", Mirror::new(), fixed(vec![status(campaign, 3)])));
        let mut snapshots = feed.subscribe();

        assert_eq!(feed.reload().await.unwrap(), 1);
        assert!(snapshots.has_changed().unwrap());
        assert_eq!(snapshots.borrow_and_update()[0].last_read_message_id, 3);

        let event = ChangeEvent::update(Table::ReadStatus, &status(campaign, 9)).unwrap();
        assert_eq!(feed.ingest(&event), Some(Applied::Updated));
        assert_eq!(snapshots.borrow_and_update()[0].last_read_message_id, 9);

        let replay = ChangeEvent::insert(Table::ReadStatus, &status(campaign, 9)).unwrap();
        assert_eq!(feed.ingest(&replay), Some(Applied::Duplicate));
        assert!(!snapshots.has_changed().unwrap());
    }

    #[tokio::test]
    async fn gap_triggers_one_refetch() {
        let known = Uuid::new_v4();
        let missed = Uuid::new_v4();
        let feed = Arc::new(Feed::new(
            "read status",
            Mirror::new(),
            fixed(vec![status(known, 1), status(missed, 4)]),
        ));

        let event = ChangeEvent::update(Table::ReadStatus, &status(missed, 4)).unwrap();
        assert_eq!(feed.ingest(&event), Some(Applied::Gap));
        assert!(feed.is_refetching());
        assert!(!feed.refetch_in_background());

        let mut snapshots = feed.subscribe();
        tokio::time::timeout(Duration::from_secs(1), snapshots.wait_for(|rows| rows.len() == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feed.get(&missed).map(|s| s.last_read_message_id), Some(4));
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let feed = Arc::new(Feed::<ReadStatus>::new("read status", Mirror::new(), fixed(Vec::new())));
        let event = ChangeEvent::insert(Table::ReadStatus, &serde_json::json!({ "campaign_id": 5 })).unwrap();
        assert_eq!(feed.ingest(&event), None);
        assert!(feed.is_empty());
    }

    #[test]
    fn filter_hides_rows_from_reads() {
        let feed = Feed::new("read status", Mirror::new(), fixed(Vec::new()))
            .filtered(|s: &ReadStatus| s.last_read_message_id > 0);
        feed.upsert(status(Uuid::new_v4(), 0));
        feed.upsert(status(Uuid::new_v4(), 2));
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.subscribe().borrow().len(), 1);
    }
}
