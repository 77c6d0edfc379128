use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{ChangeEvent, ChangeKind, Table};

/// Equality filter on a single column, written `column=eq.value` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match event.column(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// One (table, event kind, optional row filter) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub table: Table,
    /// `None` means every kind of change.
    pub kind: Option<ChangeKind>,
    pub filter: Option<RowFilter>,
}

impl Interest {
    pub fn all(table: Table) -> Self {
        Self {
            table,
            kind: None,
            filter: None,
        }
    }

    pub fn on(table: Table, kind: ChangeKind) -> Self {
        Self {
            table,
            kind: Some(kind),
            filter: None,
        }
    }

    pub fn filtered(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table.as_str()
            && self.kind.is_none_or(|kind| kind == event.kind)
            && self.filter.as_ref().is_none_or(|filter| filter.matches(event))
    }
}

/// What a channel receives change notifications for. Fixed once the channel
/// is opened; changing interest means opening a new channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    interests: Vec<Interest>,
}

impl SubscriptionDescriptor {
    /// A descriptor with no table interest, for broadcast-only channels.
    pub fn broadcast_only() -> Self {
        Self::default()
    }

    pub fn with(mut self, interest: Interest) -> Self {
        self.interests.push(interest);
        self
    }

    pub fn interests(&self) -> &[Interest] {
        &self.interests
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }

    /// A notification is delivered when any interest matches; the clauses are unioned.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.interests.iter().any(|interest| interest.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn event(table: Table, kind: ChangeKind, record: Value) -> ChangeEvent {
        ChangeEvent {
            table: table.as_str().into(),
            kind,
            record,
            old_record: Value::Null,
            commit_timestamp: Utc::now(),
        }
    }

    #[test]
    fn either_party_filter_is_a_union() {
        let descriptor = SubscriptionDescriptor::default()
            .with(Interest::all(Table::Friendships).filtered(RowFilter::eq("requester_id", "u1")))
            .with(Interest::all(Table::Friendships).filtered(RowFilter::eq("addressee_id", "u1")));

        let as_requester = event(
            Table::Friendships,
            ChangeKind::Insert,
            json!({ "requester_id": "u1", "addressee_id": "u2" }),
        );
        let as_addressee = event(
            Table::Friendships,
            ChangeKind::Update,
            json!({ "requester_id": "u3", "addressee_id": "u1" }),
        );
        let unrelated = event(
            Table::Friendships,
            ChangeKind::Insert,
            json!({ "requester_id": "u3", "addressee_id": "u4" }),
        );

        assert!(descriptor.matches(&as_requester));
        assert!(descriptor.matches(&as_addressee));
        assert!(!descriptor.matches(&unrelated));
    }

    #[test]
    fn kind_and_numeric_filters() {
        let interest = Interest::on(Table::CampaignHistory, ChangeKind::Insert)
            .filtered(RowFilter::eq("campaign_id", 42));

        assert!(interest.matches(&event(
            Table::CampaignHistory,
            ChangeKind::Insert,
            json!({ "campaign_id": 42 }),
        )));
        assert!(!interest.matches(&event(
            Table::CampaignHistory,
            ChangeKind::Update,
            json!({ "campaign_id": 42 }),
        )));
        assert_eq!(interest.filter.unwrap().to_string(), "campaign_id=eq.42");
    }
}
