//! Integration tests for the reconciliation engine and backlog processor
//!
//! Runs against in-memory SQLite and an in-memory platform double; no
//! network, and delays shrunk to a few milliseconds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autocred_sync::config::BacklogSettings;
use autocred_sync::db::sync_records::{self, SyncStatus};
use autocred_sync::db::{init_memory_pool, leads, mappings};
use autocred_sync::platform::{
    LookupIdentifiers, PlatformApi, PlatformError, Subscriber, Tag,
};
use autocred_sync::sync::{BacklogProcessor, ReconciliationEngine};
use autocred_sync::tags::{StageTagMapping, TagDirectory, TagKind};
use sqlx::SqlitePool;
use uuid::Uuid;

const SETTLE: Duration = Duration::from_millis(5);
const MAX_RETRY: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    SetField(String, String, String),
    RemoveTag(String, String),
    AddTag(String, String),
}

#[derive(Default)]
struct FakeInner {
    subscribers: Mutex<HashMap<String, Subscriber>>,
    calls: Mutex<Vec<Call>>,
    /// Fail the next N add_tag calls with a transient error
    failing_adds: Mutex<u32>,
}

/// In-memory platform double recording every mutation call
#[derive(Clone, Default)]
struct FakePlatform {
    inner: Arc<FakeInner>,
}

impl FakePlatform {
    fn with_subscriber(self, id: &str, tag_names: &[&str]) -> Self {
        let subscriber = Subscriber {
            id: id.to_string(),
            phone: Some("+5215512345678".to_string()),
            email: None,
            whatsapp_phone: None,
            ig_username: None,
            tags: tag_names
                .iter()
                .map(|n| Tag {
                    id: None,
                    name: n.to_string(),
                })
                .collect(),
            custom_fields: serde_json::Value::Null,
        };
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(id.to_string(), subscriber);
        self
    }

    fn fail_next_adds(&self, count: u32) {
        *self.inner.failing_adds.lock().unwrap() = count;
    }

    fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().unwrap().clone()
    }

    fn mutation_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::AddTag(_, _) | Call::RemoveTag(_, _)))
            .collect()
    }

    fn tags_of(&self, id: &str) -> Vec<String> {
        self.inner.subscribers.lock().unwrap()[id]
            .tags
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }
}

impl PlatformApi for FakePlatform {
    async fn find_subscriber(
        &self,
        ids: &LookupIdentifiers,
    ) -> Result<Option<Subscriber>, PlatformError> {
        Ok(ids
            .subscriber_id
            .as_ref()
            .and_then(|id| self.inner.subscribers.lock().unwrap().get(id).cloned()))
    }

    async fn add_tag(&self, subscriber_id: &str, tag_name: &str) -> Result<(), PlatformError> {
        {
            let mut failing = self.inner.failing_adds.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(PlatformError::Api(500, "internal error".to_string()));
            }
        }
        self.inner.calls.lock().unwrap().push(Call::AddTag(
            subscriber_id.to_string(),
            tag_name.to_string(),
        ));
        if let Some(sub) = self
            .inner
            .subscribers
            .lock()
            .unwrap()
            .get_mut(subscriber_id)
        {
            if !sub.has_tag(tag_name) {
                sub.tags.push(Tag {
                    id: None,
                    name: tag_name.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn remove_tag(&self, subscriber_id: &str, tag_name: &str) -> Result<(), PlatformError> {
        self.inner.calls.lock().unwrap().push(Call::RemoveTag(
            subscriber_id.to_string(),
            tag_name.to_string(),
        ));
        if let Some(sub) = self
            .inner
            .subscribers
            .lock()
            .unwrap()
            .get_mut(subscriber_id)
        {
            let wanted = tag_name.trim().to_lowercase();
            sub.tags.retain(|t| t.name.trim().to_lowercase() != wanted);
        }
        Ok(())
    }

    async fn set_custom_field(
        &self,
        subscriber_id: &str,
        field_name: &str,
        value: &str,
    ) -> Result<(), PlatformError> {
        self.inner.calls.lock().unwrap().push(Call::SetField(
            subscriber_id.to_string(),
            field_name.to_string(),
            value.to_string(),
        ));
        Ok(())
    }
}

async fn seed_mappings(pool: &SqlitePool, preaprobado_retrigger: bool) {
    let rows = [
        ("CONSULTANDO_CREDITO", "lead-consultando", TagKind::Pipeline, false),
        ("PREAPROBADO", "credito-preaprobado", TagKind::Pipeline, preaprobado_retrigger),
        ("APARTADO", "unidad-apartada", TagKind::Pipeline, false),
        ("ATENCION", "atencion-humana", TagKind::Business, false),
    ];
    for (stage, tag, kind, force_retrigger) in rows {
        mappings::insert_mapping(
            pool,
            &StageTagMapping {
                stage: stage.to_string(),
                tag: tag.to_string(),
                kind,
                force_retrigger,
            },
        )
        .await
        .unwrap();
    }
}

async fn linked_lead(pool: &SqlitePool, subscriber_id: &str, stage: &str) -> leads::Lead {
    let mut lead = leads::Lead::new(stage);
    lead.external_subscriber_id = Some(subscriber_id.to_string());
    leads::save_lead(pool, &lead).await.unwrap();
    lead
}

async fn engine_with(
    pool: &SqlitePool,
    platform: FakePlatform,
) -> ReconciliationEngine<FakePlatform> {
    let directory = TagDirectory::load(pool).await.unwrap();
    ReconciliationEngine::new(platform, directory, pool.clone(), SETTLE, MAX_RETRY)
}

fn backlog_settings() -> BacklogSettings {
    BacklogSettings {
        batch_size: 10,
        max_retry: MAX_RETRY,
        sweep_interval: Duration::from_secs(60),
        record_delay: Duration::from_millis(1),
        batch_delay: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn test_stage_move_removes_stale_keeps_business_adds_target() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform =
        FakePlatform::default().with_subscriber("mc-1001", &["lead-consultando", "atencion-humana"]);
    let lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = engine_with(&pool, platform.clone()).await;

    let synced = engine
        .reconcile(
            lead.id,
            Some("mc-1001"),
            Some("CONSULTANDO_CREDITO"),
            "PREAPROBADO",
        )
        .await
        .unwrap();
    assert!(synced);

    assert_eq!(
        platform.mutation_calls(),
        vec![
            Call::RemoveTag("mc-1001".to_string(), "lead-consultando".to_string()),
            Call::AddTag("mc-1001".to_string(), "credito-preaprobado".to_string()),
        ]
    );

    let final_tags = platform.tags_of("mc-1001");
    assert!(final_tags.contains(&"atencion-humana".to_string()));
    assert!(final_tags.contains(&"credito-preaprobado".to_string()));
    assert!(!final_tags.contains(&"lead-consultando".to_string()));

    let record_id: String = sqlx::query_scalar("SELECT id FROM sync_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    let record = sync_records::get_record(&pool, record_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SyncStatus::Success);
    assert!(record.completed_at.is_some());
    assert_eq!(record.data["new_tag"], "credito-preaprobado");
    assert_eq!(record.data["tags_removed"][0], "lead-consultando");
}

#[tokio::test]
async fn test_channel_field_set_before_tag_mutations() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default().with_subscriber("mc-1001", &["lead-consultando"]);
    let lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = engine_with(&pool, platform.clone()).await;

    engine
        .reconcile(lead.id, Some("mc-1001"), None, "PREAPROBADO")
        .await
        .unwrap();

    let calls = platform.calls();
    assert_eq!(
        calls[0],
        Call::SetField(
            "mc-1001".to_string(),
            "canal".to_string(),
            "whatsapp".to_string()
        )
    );
}

#[tokio::test]
async fn test_multiple_stale_pipeline_tags_all_removed() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    // Drift left two pipeline tags on the subscriber
    let platform = FakePlatform::default().with_subscriber(
        "mc-1001",
        &["lead-consultando", "unidad-apartada", "atencion-humana"],
    );
    let lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = engine_with(&pool, platform.clone()).await;

    engine
        .reconcile(lead.id, Some("mc-1001"), Some("CONSULTANDO_CREDITO"), "PREAPROBADO")
        .await
        .unwrap();

    let removed: Vec<_> = platform
        .mutation_calls()
        .into_iter()
        .filter(|c| matches!(c, Call::RemoveTag(_, _)))
        .collect();
    assert_eq!(removed.len(), 2);
    assert!(platform.tags_of("mc-1001").contains(&"atencion-humana".to_string()));
}

#[tokio::test]
async fn test_already_in_sync_short_circuits_without_platform_calls() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default().with_subscriber("mc-1001", &["credito-preaprobado"]);
    let lead = linked_lead(&pool, "mc-1001", "PREAPROBADO").await;
    let engine = engine_with(&pool, platform.clone()).await;

    let synced = engine
        .reconcile(lead.id, Some("mc-1001"), Some("PREAPROBADO"), "PREAPROBADO")
        .await
        .unwrap();

    assert!(synced);
    assert!(platform.mutation_calls().is_empty());
    assert!(platform.calls().is_empty(), "short circuit skips the channel field too");
}

#[tokio::test]
async fn test_force_retrigger_readds_present_tag() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, true).await;

    let platform = FakePlatform::default().with_subscriber("mc-1001", &["Credito-Preaprobado"]);
    let lead = linked_lead(&pool, "mc-1001", "PREAPROBADO").await;
    let engine = engine_with(&pool, platform.clone()).await;

    let synced = engine
        .reconcile(lead.id, Some("mc-1001"), Some("PREAPROBADO"), "PREAPROBADO")
        .await
        .unwrap();
    assert!(synced);

    // Add asserted, then a remove-wait-readd cycle on the same tag
    assert_eq!(
        platform.mutation_calls(),
        vec![
            Call::AddTag("mc-1001".to_string(), "credito-preaprobado".to_string()),
            Call::RemoveTag("mc-1001".to_string(), "credito-preaprobado".to_string()),
            Call::AddTag("mc-1001".to_string(), "credito-preaprobado".to_string()),
        ]
    );
    assert!(platform.tags_of("mc-1001").contains(&"credito-preaprobado".to_string()));
}

#[tokio::test]
async fn test_subscriber_not_found_is_terminal() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default(); // knows no subscribers
    let lead = linked_lead(&pool, "mc-gone", "CONSULTANDO_CREDITO").await;
    let engine = engine_with(&pool, platform.clone()).await;

    let synced = engine
        .reconcile(lead.id, Some("mc-gone"), None, "PREAPROBADO")
        .await
        .unwrap();

    assert!(!synced);
    assert!(platform.calls().is_empty(), "no tag mutations for a missing subscriber");

    // Exactly one record, permanently failed (out of the retryable set)
    assert!(sync_records::list_retryable(&pool, MAX_RETRY, 10).await.unwrap().is_empty());
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_unlinked_lead_fails_fast_with_record() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let lead = leads::Lead::new("CONSULTANDO_CREDITO");
    leads::save_lead(&pool, &lead).await.unwrap();
    let engine = engine_with(&pool, FakePlatform::default()).await;

    let synced = engine
        .reconcile(lead.id, None, None, "PREAPROBADO")
        .await
        .unwrap();

    assert!(!synced);
    assert!(sync_records::list_retryable(&pool, MAX_RETRY, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unmapped_stage_skips_without_record() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = engine_with(&pool, FakePlatform::default()).await;

    let synced = engine
        .reconcile(lead.id, Some("mc-1001"), None, "ENTREGADO")
        .await
        .unwrap();

    assert!(!synced);
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0, "nothing actionable, no ledger record");
}

#[tokio::test]
async fn test_backlog_replays_transient_failure_to_success() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default().with_subscriber("mc-1001", &["lead-consultando"]);
    platform.fail_next_adds(1);
    let lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = Arc::new(engine_with(&pool, platform.clone()).await);

    let synced = engine
        .reconcile(lead.id, Some("mc-1001"), Some("CONSULTANDO_CREDITO"), "PREAPROBADO")
        .await
        .unwrap();
    assert!(!synced);

    let retryable = sync_records::list_retryable(&pool, MAX_RETRY, 10).await.unwrap();
    assert_eq!(retryable.len(), 1);
    assert_eq!(retryable[0].status, SyncStatus::Failed);

    let backlog = BacklogProcessor::new(pool.clone(), engine, backlog_settings());
    let succeeded = backlog.drain_once().await.unwrap();
    assert_eq!(succeeded, 1);

    let record = sync_records::get_record(&pool, retryable[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SyncStatus::Success);
    assert_eq!(record.data["replayed"], serde_json::json!(true));
    assert!(platform.tags_of("mc-1001").contains(&"credito-preaprobado".to_string()));
}

#[tokio::test]
async fn test_backlog_exhausts_retry_budget() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default().with_subscriber("mc-1001", &["lead-consultando"]);
    platform.fail_next_adds(100);
    let lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = Arc::new(engine_with(&pool, platform.clone()).await);

    engine
        .reconcile(lead.id, Some("mc-1001"), None, "PREAPROBADO")
        .await
        .unwrap();
    let record_id = sync_records::list_retryable(&pool, MAX_RETRY, 10).await.unwrap()[0].id;

    let backlog = BacklogProcessor::new(pool.clone(), engine, backlog_settings());

    // One failed replay per sweep; the third reaches the budget
    for expected_count in 1..=2u32 {
        backlog.drain_once().await.unwrap();
        let record = sync_records::get_record(&pool, record_id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, expected_count);
    }
    backlog.drain_once().await.unwrap();

    let record = sync_records::get_record(&pool, record_id).await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Failed);
    assert_eq!(record.retry_count, MAX_RETRY);
    assert!(sync_records::list_retryable(&pool, MAX_RETRY, 10).await.unwrap().is_empty());

    // Exhausted records are not picked up again
    assert_eq!(backlog.drain_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_backlog_sweep_reaches_records_beyond_first_failing_batch() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default()
        .with_subscriber("mc-1", &["lead-consultando"])
        .with_subscriber("mc-2", &["lead-consultando"])
        .with_subscriber("mc-3", &["lead-consultando"]);
    platform.fail_next_adds(100);
    let engine = Arc::new(engine_with(&pool, platform.clone()).await);

    for subscriber_id in ["mc-1", "mc-2", "mc-3"] {
        let lead = linked_lead(&pool, subscriber_id, "CONSULTANDO_CREDITO").await;
        engine
            .reconcile(lead.id, Some(subscriber_id), None, "PREAPROBADO")
            .await
            .unwrap();
        // Distinct created_at timestamps
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // The oldest window keeps failing; the sweep must still reach the
    // record behind it instead of breaking after the first batch
    let mut settings = backlog_settings();
    settings.batch_size = 2;
    let backlog = BacklogProcessor::new(pool.clone(), engine, settings);
    assert_eq!(backlog.drain_once().await.unwrap(), 0);

    let counts: Vec<i64> =
        sqlx::query_scalar("SELECT retry_count FROM sync_records ORDER BY created_at ASC")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(counts, vec![1, 1, 1]);
}

#[tokio::test]
async fn test_backlog_abandons_deleted_lead() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default().with_subscriber("mc-1001", &["lead-consultando"]);
    platform.fail_next_adds(1);
    let lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = Arc::new(engine_with(&pool, platform.clone()).await);

    engine
        .reconcile(lead.id, Some("mc-1001"), None, "PREAPROBADO")
        .await
        .unwrap();

    sqlx::query("DELETE FROM leads WHERE id = ?")
        .bind(lead.id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let backlog = BacklogProcessor::new(pool.clone(), engine, backlog_settings());
    assert_eq!(backlog.drain_once().await.unwrap(), 0);

    assert!(sync_records::list_retryable(&pool, MAX_RETRY, 10).await.unwrap().is_empty());
    let error: Option<String> = sqlx::query_scalar("SELECT error FROM sync_records LIMIT 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(error.as_deref(), Some("lead no longer exists"));
}

#[tokio::test]
async fn test_backlog_abandons_unlinked_lead() {
    let pool = init_memory_pool().await.unwrap();
    seed_mappings(&pool, false).await;

    let platform = FakePlatform::default().with_subscriber("mc-1001", &["lead-consultando"]);
    platform.fail_next_adds(1);
    let mut lead = linked_lead(&pool, "mc-1001", "CONSULTANDO_CREDITO").await;
    let engine = Arc::new(engine_with(&pool, platform.clone()).await);

    engine
        .reconcile(lead.id, Some("mc-1001"), None, "PREAPROBADO")
        .await
        .unwrap();

    // The link to the platform was dropped after the record was written
    lead.external_subscriber_id = None;
    leads::save_lead(&pool, &lead).await.unwrap();

    let backlog = BacklogProcessor::new(pool.clone(), engine, backlog_settings());
    assert_eq!(backlog.drain_once().await.unwrap(), 0);
    assert!(sync_records::list_retryable(&pool, MAX_RETRY, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_engine_uuid_roundtrip_via_ledger() {
    let pool = init_memory_pool().await.unwrap();
    let lead_id = Uuid::new_v4();
    let id = sync_records::insert_pending(
        &pool,
        lead_id,
        "stage_tag_sync",
        "outbound",
        &serde_json::json!({"new_stage": "PREAPROBADO"}),
    )
    .await
    .unwrap();

    let record = sync_records::get_record(&pool, id).await.unwrap().unwrap();
    assert_eq!(record.lead_id, lead_id);
}
