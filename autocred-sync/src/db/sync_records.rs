//! Sync ledger operations
//!
//! Append-only audit plus retry queue for reconciliation attempts. Records are
//! created `pending`, then transition to `success` (terminal) or `failed`
//! (retryable while `retry_count` is under the budget). Permanent failure is
//! encoded by saturating `retry_count` at the budget, which drops the record
//! out of [`list_retryable`].

use autocred_common::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Sync record lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => SyncStatus::Success,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }
}

/// One reconciliation attempt in the ledger
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub sync_type: String,
    pub status: SyncStatus,
    pub direction: String,
    /// Free-form JSON payload (previous/new stage, tags added/removed).
    /// Schema-less by design; debugging aid and backlog replay input.
    pub data: serde_json::Value,
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Insert a new pending record, returning its id
pub async fn insert_pending(
    pool: &SqlitePool,
    lead_id: Uuid,
    sync_type: &str,
    direction: &str,
    data: &serde_json::Value,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO sync_records (id, lead_id, sync_type, status, direction, data, retry_count, created_at)
        VALUES (?, ?, ?, 'pending', ?, ?, 0, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(lead_id.to_string())
    .bind(sync_type)
    .bind(direction)
    .bind(data.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(id)
}

/// Mark a record successful, replacing its payload with the final outcome
pub async fn mark_success(pool: &SqlitePool, id: Uuid, data: &serde_json::Value) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_records
        SET status = 'success', data = ?, error = NULL, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(data.to_string())
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a record failed but retryable. Does not consume retry budget;
/// the backlog processor increments the count after its own replays.
pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_records
        SET status = 'failed', error = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(error)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a record permanently failed (non-retryable reason or budget
/// exhausted): saturate retry_count so `list_retryable` skips it.
pub async fn mark_failed_permanently(
    pool: &SqlitePool,
    id: Uuid,
    error: &str,
    max_retry: u32,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_records
        SET status = 'failed', error = ?, retry_count = MAX(retry_count, ?), completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(error)
    .bind(max_retry as i64)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed replay: increment the retry count
pub async fn increment_retry(pool: &SqlitePool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_records
        SET status = 'failed', error = ?, retry_count = retry_count + 1, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(error)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Select the oldest records still worth retrying: pending or failed, with
/// retry budget remaining.
pub async fn list_retryable(
    pool: &SqlitePool,
    max_retry: u32,
    batch_size: u32,
) -> Result<Vec<SyncRecord>> {
    list_retryable_excluding(pool, max_retry, batch_size, &[]).await
}

/// Same selection, skipping the given ids. A record that fails its replay
/// stays retryable with the same created_at, so a drain sweep must exclude
/// what it already attempted or the oldest failing window hides everything
/// behind it.
pub async fn list_retryable_excluding(
    pool: &SqlitePool,
    max_retry: u32,
    batch_size: u32,
    exclude: &[Uuid],
) -> Result<Vec<SyncRecord>> {
    let mut sql = String::from(
        "SELECT id, lead_id, sync_type, status, direction, data, error, retry_count, created_at, completed_at \
         FROM sync_records \
         WHERE status IN ('pending', 'failed') AND retry_count < ?",
    );
    if !exclude.is_empty() {
        let placeholders = vec!["?"; exclude.len()].join(", ");
        sql.push_str(" AND id NOT IN (");
        sql.push_str(&placeholders);
        sql.push(')');
    }
    sql.push_str(" ORDER BY created_at ASC LIMIT ?");

    let mut query = sqlx::query(&sql).bind(max_retry as i64);
    for id in exclude {
        query = query.bind(id.to_string());
    }
    let rows = query.bind(batch_size as i64).fetch_all(pool).await?;

    rows.iter().map(row_to_record).collect()
}

/// Load one record by id
pub async fn get_record(pool: &SqlitePool, id: Uuid) -> Result<Option<SyncRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, lead_id, sync_type, status, direction, data, error, retry_count, created_at, completed_at
        FROM sync_records WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(row_to_record(&row)?)),
        None => Ok(None),
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<SyncRecord> {
    let id: String = row.get("id");
    let lead_id: String = row.get("lead_id");
    let status: String = row.get("status");
    let data: String = row.get("data");
    let created_at: String = row.get("created_at");
    let completed_at: Option<String> = row.get("completed_at");

    let parse_uuid = |s: &str| {
        Uuid::parse_str(s)
            .map_err(|e| autocred_common::Error::Internal(format!("Invalid record uuid: {}", e)))
    };
    // A malformed timestamp or payload is ledger corruption; masking it with
    // a fallback would silently reorder the retry queue
    let parse_datetime = |field: &str, s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                autocred_common::Error::Internal(format!("Invalid {} in ledger row: {}", field, e))
            })
    };

    Ok(SyncRecord {
        id: parse_uuid(&id)?,
        lead_id: parse_uuid(&lead_id)?,
        sync_type: row.get("sync_type"),
        status: SyncStatus::parse(&status),
        direction: row.get("direction"),
        data: serde_json::from_str(&data).map_err(|e| {
            autocred_common::Error::Internal(format!("Invalid data payload in ledger row: {}", e))
        })?,
        error: row.get("error"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        created_at: parse_datetime("created_at", &created_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_datetime("completed_at", s))
            .transpose()?,
    })
}
