//! Local copies of store-backed collections and the reducer that keeps them
//! in step with change notifications.
//!
//! A [`Mirror`] never does I/O. Notifications may be duplicated or arrive out
//! of order; the reducer deduplicates by key and keeps rows in the record's
//! domain order, so the result only depends on the set of changes applied.

use std::cmp::Ordering;
use std::hash::Hash;

use saga_types::events::Change;
use saga_types::models::{CampaignMessage, CampaignSummary, CharacterLevel, PlayerAction, ReadStatus};
use uuid::Uuid;

/// A row that can live in a [`Mirror`].
pub trait Record: Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Send + Sync + std::fmt::Debug;

    fn key(&self) -> Self::Key;

    /// Domain order. Rows comparing `Less` come first.
    fn order(&self, other: &Self) -> Ordering;
}

impl Record for CampaignMessage {
    type Key = i64;

    fn key(&self) -> i64 {
        self.id
    }

    fn order(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Record for PlayerAction {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.id
    }

    fn order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Mirrors hold one user's statuses, so the campaign identifies the row.
impl Record for ReadStatus {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.campaign_id
    }

    fn order(&self, other: &Self) -> Ordering {
        self.campaign_id.cmp(&other.campaign_id)
    }
}

impl Record for CharacterLevel {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.character_id
    }

    fn order(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.character_id.cmp(&other.character_id))
    }
}

impl Record for CampaignSummary {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.campaign_id
    }

    fn order(&self, other: &Self) -> Ordering {
        other
            .updated_at
            .cmp(&self.updated_at)
            .then_with(|| self.campaign_id.cmp(&other.campaign_id))
    }
}

/// What a change did to a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// Insert for a key already present. Nothing changed.
    Duplicate,
    Updated,
    Removed,
    /// Delete for a key that is not present. Nothing changed.
    Missing,
    /// Update for a key never inserted here: an event was missed and the
    /// scope needs a full re-fetch.
    Gap,
    /// Change to a row older than everything a full, capped mirror retains.
    OutOfWindow,
}

impl Applied {
    pub fn changed(self) -> bool {
        matches!(self, Applied::Inserted | Applied::Updated | Applied::Removed)
    }
}

/// Ordered, key-unique rows with an optional size cap.
///
/// When capped, only the last `cap` rows in domain order are kept; for
/// ascending histories that means the most recent ones.
#[derive(Debug, Clone)]
pub struct Mirror<R: Record> {
    rows: Vec<R>,
    cap: Option<usize>,
}

impl<R: Record> Default for Mirror<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Mirror<R> {
    pub fn new() -> Self {
        Self { rows: Vec::new(), cap: None }
    }

    pub fn capped(cap: usize) -> Self {
        Self {
            rows: Vec::new(),
            cap: Some(cap),
        }
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.position(key).map(|at| &self.rows[at])
    }

    pub fn contains(&self, key: &R::Key) -> bool {
        self.position(key).is_some()
    }

    pub fn apply(&mut self, change: Change<R>) -> Applied {
        match change {
            Change::Insert(row) => {
                if self.contains(&row.key()) {
                    Applied::Duplicate
                } else if self.outside_window(&row) {
                    Applied::OutOfWindow
                } else {
                    self.place(row);
                    Applied::Inserted
                }
            }
            Change::Update(row) => match self.position(&row.key()) {
                Some(at) => {
                    self.rows.remove(at);
                    self.place(row);
                    Applied::Updated
                }
                None if self.outside_window(&row) => Applied::OutOfWindow,
                None => Applied::Gap,
            },
            Change::Delete(row) => match self.position(&row.key()) {
                Some(at) => {
                    self.rows.remove(at);
                    Applied::Removed
                }
                None => Applied::Missing,
            },
        }
    }

    /// Insert or replace without gap detection. Used for rows this client
    /// wrote itself and got back from the store.
    pub fn upsert(&mut self, row: R) -> Applied {
        match self.position(&row.key()) {
            Some(at) => {
                self.rows.remove(at);
                self.place(row);
                Applied::Updated
            }
            None => {
                self.place(row);
                Applied::Inserted
            }
        }
    }

    /// Wholesale replacement from a full fetch. Later duplicates win.
    pub fn replace_all(&mut self, rows: Vec<R>) {
        self.rows.clear();
        for row in rows {
            self.upsert(row);
        }
    }

    pub fn remove(&mut self, key: &R::Key) -> Option<R> {
        self.position(key).map(|at| self.rows.remove(at))
    }

    /// Keeps only rows matching `keep`. Returns how many were dropped.
    pub fn retain(&mut self, keep: impl FnMut(&R) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(keep);
        before - self.rows.len()
    }

    fn position(&self, key: &R::Key) -> Option<usize> {
        self.rows.iter().position(|row| &row.key() == key)
    }

    fn outside_window(&self, row: &R) -> bool {
        match (self.cap, self.rows.first()) {
            (Some(cap), Some(oldest)) => self.rows.len() >= cap && row.order(oldest) == Ordering::Less,
            _ => false,
        }
    }

    fn place(&mut self, row: R) {
        let at = self.rows.partition_point(|existing| existing.order(&row) != Ordering::Greater);
        self.rows.insert(at, row);
        if let Some(cap) = self.cap {
            if self.rows.len() > cap {
                let excess = self.rows.len() - cap;
                self.rows.drain(..excess);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use saga_types::models::MessageKind;

    use super::*;

    fn message(id: i64) -> CampaignMessage {
        CampaignMessage {
            id,
            campaign_id: Uuid::nil(),
            author_id: None,
            author_name: "Narrator".into(),
            kind: MessageKind::Narrator,
            content: format!("message {id}"),
            character_id: None,
            // Deliberately unrelated to id order.
            created_at: Utc.timestamp_opt(1_700_000_000 - id, 0).unwrap(),
        }
    }

    fn ids(mirror: &Mirror<CampaignMessage>) -> Vec<i64> {
        mirror.rows().iter().map(|m| m.id).collect()
    }

    #[test]
    fn out_of_order_inserts_end_up_sorted_by_id() {
        let mut mirror = Mirror::new();
        for id in [5, 3, 4] {
            assert_eq!(mirror.apply(Change::Insert(message(id))), Applied::Inserted);
        }
        assert_eq!(ids(&mirror), [3, 4, 5]);
    }

    #[test]
    fn replayed_insert_is_kept_once() {
        let mut mirror = Mirror::new();
        assert_eq!(mirror.apply(Change::Insert(message(7))), Applied::Inserted);
        assert_eq!(mirror.apply(Change::Insert(message(7))), Applied::Duplicate);
        assert_eq!(ids(&mirror), [7]);
    }

    #[test]
    fn cap_drops_oldest() {
        let mut mirror = Mirror::capped(3);
        for id in [10, 12, 11, 14, 13] {
            mirror.apply(Change::Insert(message(id)));
            assert!(mirror.len() <= 3);
        }
        assert_eq!(ids(&mirror), [12, 13, 14]);

        // Older than the window: neither stored nor treated as a gap.
        assert_eq!(mirror.apply(Change::Insert(message(1))), Applied::OutOfWindow);
        assert_eq!(mirror.apply(Change::Update(message(2))), Applied::OutOfWindow);
        assert_eq!(ids(&mirror), [12, 13, 14]);
    }

    #[test]
    fn update_without_insert_is_a_gap() {
        let mut mirror = Mirror::new();
        mirror.apply(Change::Insert(message(1)));
        assert_eq!(mirror.apply(Change::Update(message(2))), Applied::Gap);
        assert_eq!(ids(&mirror), [1]);

        let mut edited = message(1);
        edited.content = "edited".into();
        assert_eq!(mirror.apply(Change::Update(edited)), Applied::Updated);
        assert_eq!(mirror.get(&1).map(|m| m.content.as_str()), Some("edited"));
    }

    #[test]
    fn delete_of_absent_key_is_a_noop() {
        let mut mirror = Mirror::new();
        mirror.apply(Change::Insert(message(1)));
        assert_eq!(mirror.apply(Change::Delete(message(9))), Applied::Missing);
        assert_eq!(mirror.apply(Change::Delete(message(1))), Applied::Removed);
        assert!(mirror.is_empty());
    }

    #[test]
    fn actions_sort_by_priority_then_newest() {
        let now = Utc::now();
        let action = |priority: i32, age_secs: i64| PlayerAction {
            id: Uuid::new_v4(),
            campaign_id: Uuid::nil(),
            character_id: Uuid::nil(),
            game_mode: "explore".into(),
            label: format!("p{priority} age{age_secs}"),
            priority,
            created_at: now - Duration::seconds(age_secs),
            expires_at: None,
        };

        let mut mirror = Mirror::new();
        mirror.replace_all(vec![action(1, 0), action(5, 60), action(5, 10), action(3, 0)]);
        let labels: Vec<_> = mirror.rows().iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, ["p5 age10", "p5 age60", "p3 age0", "p1 age0"]);
    }

    #[test]
    fn summary_update_moves_it_to_the_front() {
        let now = Utc::now();
        let summary = |title: &str, minutes_ago: i64| CampaignSummary {
            campaign_id: Uuid::new_v4(),
            title: title.into(),
            summary: String::new(),
            current_turn_player_id: None,
            message_count: 0,
            updated_at: now - Duration::minutes(minutes_ago),
        };

        let mut mirror = Mirror::new();
        let mut old = summary("old", 30);
        mirror.replace_all(vec![old.clone(), summary("new", 1)]);
        assert_eq!(mirror.rows()[0].title, "new");

        old.updated_at = now;
        assert_eq!(mirror.apply(Change::Update(old)), Applied::Updated);
        assert_eq!(mirror.rows()[0].title, "old");
        assert_eq!(mirror.len(), 2);
    }
}
