//! HTTP API handlers for autocred-sync

pub mod health;
pub mod stage_change;

pub use health::health_routes;
pub use stage_change::sync_routes;
