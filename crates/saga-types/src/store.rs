use std::time::Duration;

use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::models::{
    ActionScope, CampaignMessage, CampaignSummary, CharacterLevel, NewMessage, PlayerAction, ReadStatus,
};

/// Errors reported by the backing store.
///
/// Authentication failures are kept apart from everything else: a stale
/// session has to be refreshed, retrying with it only reproduces the error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected by store: {0}")]
    Rejected(String),
    #[error("record not found")]
    NotFound,
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn is_auth(&self) -> bool {
        matches!(self, StoreError::Auth(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read and write access to the hosted relational store.
///
/// Every read returns rows in the domain order used by the local mirrors.
pub trait BackingStore: Send + Sync {
    /// Cheapest possible round trip, used as a liveness probe.
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>>;

    /// The `limit` most recent messages of a campaign, ascending by id.
    fn fetch_history(&self, campaign_id: Uuid, limit: usize) -> BoxFuture<'_, StoreResult<Vec<CampaignMessage>>>;

    fn insert_message(&self, message: NewMessage) -> BoxFuture<'_, StoreResult<CampaignMessage>>;

    fn fetch_read_status(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<ReadStatus>>>;

    /// Creates the (user, campaign) row on first call and updates it afterwards.
    fn upsert_read_status(&self, status: ReadStatus) -> BoxFuture<'_, StoreResult<ReadStatus>>;

    /// Actions for one scope, highest priority first then newest first.
    fn fetch_actions(&self, scope: ActionScope) -> BoxFuture<'_, StoreResult<Vec<PlayerAction>>>;

    fn delete_action(&self, action_id: Uuid) -> BoxFuture<'_, StoreResult<()>>;

    fn fetch_characters(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<CharacterLevel>>>;

    /// Summaries of every campaign the user belongs to, most recently updated first.
    fn fetch_summaries(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<CampaignSummary>>>;
}
