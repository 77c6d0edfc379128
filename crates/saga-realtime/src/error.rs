/// Transport conditions that survive the supervisor's own recovery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("connection to {channel} lost after {attempts} reconnect attempts")]
    RetriesExhausted { channel: String, attempts: u32 },
    #[error("channel {0} is closed")]
    Closed(String),
}
