//! Client-side realtime plumbing: channel lifecycle, reconnection, health
//! probing, per-user multiplexing and turn-coordination broadcasts.

pub mod error;
pub mod health;
pub mod memory;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod teardown;
pub mod transport;
pub mod turn;

pub use error::RealtimeError;
pub use registry::{ChannelRegistry, SubscriptionCache};
pub use supervisor::{ChannelHandle, ConnectionSupervisor, SupervisorConfig};
pub use teardown::Teardown;
pub use transport::{Transport, TransportEvent};
