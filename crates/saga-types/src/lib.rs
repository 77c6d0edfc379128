pub mod events;
pub mod models;
pub mod store;
pub mod subscription;
