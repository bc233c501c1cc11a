//! autocred-sync library interface
//!
//! Pipeline-stage ↔ messaging-platform tag synchronization service for the
//! AutoCred CRM. Exposes the reconciliation engine, platform client, sync
//! ledger and backlog processor, plus the HTTP surface.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod platform;
pub mod sync;
pub mod tags;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::platform::PlatformClient;
use crate::sync::ReconciliationEngine;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Reconciliation engine, shared with the backlog processor
    pub engine: Arc<ReconciliationEngine<PlatformClient>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last infrastructure error for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(db: SqlitePool, engine: Arc<ReconciliationEngine<PlatformClient>>) -> Self {
        Self {
            db,
            engine,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::sync_routes())
        .with_state(state)
}
