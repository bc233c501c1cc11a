//! Stage → tag mapping table access
//!
//! The mapping table is maintained by an external configuration process and
//! is read-only here. Rows feed the in-memory [`TagDirectory`]
//! (`crate::tags::TagDirectory`).

use crate::tags::{StageTagMapping, TagKind};
use autocred_common::Result;
use sqlx::{Row, SqlitePool};

/// Load all active stage → tag mappings
pub async fn list_active_mappings(pool: &SqlitePool) -> Result<Vec<StageTagMapping>> {
    let rows = sqlx::query(
        r#"
        SELECT stage, tag, tag_kind, force_retrigger
        FROM stage_tag_mappings
        WHERE is_active = 1
        ORDER BY stage
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut mappings = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.get("tag_kind");
        mappings.push(StageTagMapping {
            stage: row.get("stage"),
            tag: row.get("tag"),
            kind: match kind.as_str() {
                "pipeline" => TagKind::Pipeline,
                _ => TagKind::Business,
            },
            force_retrigger: row.get::<i64, _>("force_retrigger") != 0,
        });
    }

    Ok(mappings)
}

/// Insert a mapping row (used by seeding and tests; production rows come from
/// the configuration process)
pub async fn insert_mapping(pool: &SqlitePool, mapping: &StageTagMapping) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stage_tag_mappings (stage, tag, tag_kind, is_active, force_retrigger)
        VALUES (?, ?, ?, 1, ?)
        "#,
    )
    .bind(&mapping.stage)
    .bind(&mapping.tag)
    .bind(match mapping.kind {
        TagKind::Pipeline => "pipeline",
        TagKind::Business => "business",
    })
    .bind(mapping.force_retrigger as i64)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;

    #[tokio::test]
    async fn test_list_active_mappings() {
        let pool = init_memory_pool().await.unwrap();

        insert_mapping(
            &pool,
            &StageTagMapping {
                stage: "PREAPROBADO".to_string(),
                tag: "credito-preaprobado".to_string(),
                kind: TagKind::Pipeline,
                force_retrigger: true,
            },
        )
        .await
        .unwrap();
        insert_mapping(
            &pool,
            &StageTagMapping {
                stage: "ATENCION".to_string(),
                tag: "atencion-humana".to_string(),
                kind: TagKind::Business,
                force_retrigger: false,
            },
        )
        .await
        .unwrap();

        let mappings = list_active_mappings(&pool).await.unwrap();
        assert_eq!(mappings.len(), 2);

        let pre = mappings
            .iter()
            .find(|m| m.stage == "PREAPROBADO")
            .unwrap();
        assert_eq!(pre.tag, "credito-preaprobado");
        assert_eq!(pre.kind, TagKind::Pipeline);
        assert!(pre.force_retrigger);
    }

    #[tokio::test]
    async fn test_duplicate_active_pipeline_mapping_rejected() {
        let pool = init_memory_pool().await.unwrap();

        let mapping = StageTagMapping {
            stage: "PREAPROBADO".to_string(),
            tag: "credito-preaprobado".to_string(),
            kind: TagKind::Pipeline,
            force_retrigger: false,
        };
        insert_mapping(&pool, &mapping).await.unwrap();

        let duplicate = StageTagMapping {
            tag: "otro-tag".to_string(),
            ..mapping
        };
        assert!(insert_mapping(&pool, &duplicate).await.is_err());
    }
}
