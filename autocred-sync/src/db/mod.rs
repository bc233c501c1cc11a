//! Database access for autocred-sync
//!
//! SQLite-backed persistence for leads, the stage → tag mapping directory,
//! and the sync ledger.

pub mod leads;
pub mod mappings;
pub mod sync_records;

use autocred_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Connects to the shared CRM database, creating it if missing.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create an in-memory pool with tables, for tests.
///
/// Pinned to a single long-lived connection: every pooled connection to
/// `sqlite::memory:` would otherwise open its own empty database.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Initialize autocred-sync tables
///
/// Creates leads, stage_tag_mappings and sync_records tables if they don't
/// exist. The mapping table is maintained by an external configuration
/// process; this subsystem only reads it.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            name TEXT,
            phone TEXT,
            email TEXT,
            stage TEXT NOT NULL,
            external_subscriber_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_tag_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stage TEXT NOT NULL,
            tag TEXT NOT NULL,
            tag_kind TEXT NOT NULL CHECK (tag_kind IN ('pipeline', 'business')),
            is_active INTEGER NOT NULL DEFAULT 1,
            force_retrigger INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one active pipeline mapping per stage
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_active_pipeline
        ON stage_tag_mappings(stage)
        WHERE tag_kind = 'pipeline' AND is_active = 1
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_records (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL,
            sync_type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'success', 'failed')),
            direction TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_records_retryable
        ON sync_records(status, retry_count, created_at)
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (leads, stage_tag_mappings, sync_records)");

    Ok(())
}
