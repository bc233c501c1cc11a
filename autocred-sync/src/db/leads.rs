//! Lead database operations
//!
//! Leads are owned by the wider CRM; this subsystem only needs the identity,
//! pipeline stage and the link to the external messaging platform.

use autocred_common::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Lead record (subset consumed by the sync engine)
#[derive(Debug, Clone)]
pub struct Lead {
    pub id: Uuid,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Current pipeline stage identifier
    pub stage: String,
    /// Subscriber id on the external messaging platform.
    /// None means the lead was never linked there.
    pub external_subscriber_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    /// Create a new lead record in the given stage
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            phone: None,
            email: None,
            stage: stage.into(),
            external_subscriber_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Load a lead by id
pub async fn get_lead(pool: &SqlitePool, id: Uuid) -> Result<Option<Lead>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, phone, email, stage, external_subscriber_id, created_at
        FROM leads WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(row_to_lead(&row)?)),
        None => Ok(None),
    }
}

/// Insert or update a lead
pub async fn save_lead(pool: &SqlitePool, lead: &Lead) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO leads (id, name, phone, email, stage, external_subscriber_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            phone = excluded.phone,
            email = excluded.email,
            stage = excluded.stage,
            external_subscriber_id = excluded.external_subscriber_id,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(lead.id.to_string())
    .bind(&lead.name)
    .bind(&lead.phone)
    .bind(&lead.email)
    .bind(&lead.stage)
    .bind(&lead.external_subscriber_id)
    .bind(lead.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

fn row_to_lead(row: &sqlx::sqlite::SqliteRow) -> Result<Lead> {
    let id: String = row.get("id");
    let created_at: String = row.get("created_at");

    Ok(Lead {
        id: Uuid::parse_str(&id)
            .map_err(|e| autocred_common::Error::Internal(format!("Invalid lead id: {}", e)))?,
        name: row.get("name"),
        phone: row.get("phone"),
        email: row.get("email"),
        stage: row.get("stage"),
        external_subscriber_id: row.get("external_subscriber_id"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
