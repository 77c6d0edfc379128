use saga_realtime::RealtimeError;
use saga_types::store::StoreError;

/// Failures a synchronizer hands back to its caller. Everything else
/// (replays, gaps, transport blips) is recovered internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

impl SyncError {
    /// True when the user should be offered a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store(e) => matches!(e, StoreError::Network(_) | StoreError::Timeout(_)),
            SyncError::Realtime(RealtimeError::RetriesExhausted { .. }) => true,
            SyncError::Realtime(RealtimeError::Closed(_)) => false,
        }
    }
}
