//! Feature synchronizers: local mirrors of store-backed collections kept live
//! by change notifications.

pub mod actions;
pub mod error;
pub mod feed;
pub mod history;
pub mod levels;
pub mod mirror;
pub mod read_status;
pub mod summaries;

pub use actions::{ActionFeed, ActionsConfig, ActionsSync};
pub use error::SyncError;
pub use history::{CampaignHistory, HistoryConfig, HistorySync};
pub use levels::{LevelSync, LevelUp};
pub use mirror::{Applied, Mirror, Record};
pub use read_status::ReadStatusSync;
pub use summaries::SummarySync;
