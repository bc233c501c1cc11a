//! Pipeline-stage ↔ platform-tag synchronization
//!
//! [`engine`] holds the reconciliation algorithm; [`backlog`] drains the sync
//! ledger's retryable records.

pub mod backlog;
pub mod engine;

pub use backlog::BacklogProcessor;
pub use engine::{compute_delta, ReconciliationEngine, SyncError, SyncOutcome, TagDelta};
