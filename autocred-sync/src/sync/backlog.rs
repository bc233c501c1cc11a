//! Backlog processor
//!
//! Periodically drains the sync ledger's retryable records, replaying the
//! reconciliation engine's core tag-apply step with a bounded retry budget.
//! Records inside one batch run concurrently (staggered by a courtesy
//! delay); batches are sequential.
//!
//! Known, accepted race: a backlog replay can overlap a live reconciliation
//! for the same lead. Both recompute the delta from live platform state, so
//! the worst case is a redundant remove/add pair, not corruption.

use crate::config::BacklogSettings;
use crate::db::{leads, sync_records};
use crate::db::sync_records::SyncRecord;
use crate::platform::PlatformApi;
use crate::sync::engine::ReconciliationEngine;
use autocred_common::Result;
use futures::future::join_all;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sync ledger drain worker
pub struct BacklogProcessor<P> {
    db: SqlitePool,
    engine: Arc<ReconciliationEngine<P>>,
    settings: BacklogSettings,
}

impl<P: PlatformApi> BacklogProcessor<P> {
    pub fn new(
        db: SqlitePool,
        engine: Arc<ReconciliationEngine<P>>,
        settings: BacklogSettings,
    ) -> Self {
        Self {
            db,
            engine,
            settings,
        }
    }

    /// Sweep loop for `tokio::spawn`: drain, sleep, repeat.
    pub async fn run(&self) {
        info!(
            interval = ?self.settings.sweep_interval,
            batch_size = self.settings.batch_size,
            "Backlog processor started"
        );
        loop {
            match self.drain_once().await {
                Ok(0) => {}
                Ok(replayed) => info!(replayed, "Backlog sweep complete"),
                Err(e) => error!(error = %e, "Backlog sweep failed"),
            }
            tokio::time::sleep(self.settings.sweep_interval).await;
        }
    }

    /// Drain every currently retryable record once. Returns how many replays
    /// succeeded. A record retried and failed in this sweep is left for the
    /// next sweep rather than hammered again.
    pub async fn drain_once(&self) -> Result<u32> {
        let mut succeeded = 0;
        // Processed ids are excluded in the query itself: a failed replay
        // keeps its place at the front of the oldest-first ordering, and
        // post-filtering a fixed window would never see past it.
        let mut processed: Vec<Uuid> = Vec::new();

        loop {
            let batch = sync_records::list_retryable_excluding(
                &self.db,
                self.settings.max_retry,
                self.settings.batch_size,
                &processed,
            )
            .await?;
            if batch.is_empty() {
                break;
            }
            processed.extend(batch.iter().map(|r| r.id));

            let replays = batch.into_iter().enumerate().map(|(i, record)| {
                let stagger = self.settings.record_delay * i as u32;
                async move {
                    tokio::time::sleep(stagger).await;
                    self.process_record(record).await
                }
            });

            for result in join_all(replays).await {
                match result {
                    Ok(true) => succeeded += 1,
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "Backlog record processing hit an infrastructure error"),
                }
            }

            tokio::time::sleep(self.settings.batch_delay).await;
        }

        Ok(succeeded)
    }

    /// Replay one ledger record. Returns whether the replay succeeded;
    /// `Err` only for infrastructure failures (db access).
    async fn process_record(&self, record: SyncRecord) -> Result<bool> {
        let previous_stage = record
            .data
            .get("previous_stage")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let Some(new_stage) = record
            .data
            .get("new_stage")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            warn!(record_id = %record.id, "Ledger payload missing new_stage, cannot replay");
            sync_records::mark_failed_permanently(
                &self.db,
                record.id,
                "payload missing new_stage",
                self.settings.max_retry,
            )
            .await?;
            return Ok(false);
        };

        // Re-resolve the lead: it may have been deleted or re-linked since
        // the record was written
        let Some(lead) = leads::get_lead(&self.db, record.lead_id).await? else {
            warn!(record_id = %record.id, lead_id = %record.lead_id, "Lead no longer exists, abandoning record");
            sync_records::mark_failed_permanently(
                &self.db,
                record.id,
                "lead no longer exists",
                self.settings.max_retry,
            )
            .await?;
            return Ok(false);
        };
        let Some(subscriber_id) = lead.external_subscriber_id.as_deref() else {
            warn!(record_id = %record.id, lead_id = %record.lead_id, "Lead not linked to platform, abandoning record");
            sync_records::mark_failed_permanently(
                &self.db,
                record.id,
                "lead not linked to platform",
                self.settings.max_retry,
            )
            .await?;
            return Ok(false);
        };

        match self
            .engine
            .apply_stage_change(subscriber_id, previous_stage.as_deref(), &new_stage)
            .await
        {
            Ok(outcome) => {
                let payload = json!({
                    "previous_stage": previous_stage,
                    "new_stage": new_stage,
                    "previous_tag": outcome.previous_tag,
                    "new_tag": outcome.new_tag,
                    "tags_added": outcome.tags_added,
                    "tags_removed": outcome.tags_removed,
                    "retriggered": outcome.retriggered,
                    "already_in_sync": outcome.already_in_sync,
                    "replayed": true,
                });
                sync_records::mark_success(&self.db, record.id, &payload).await?;
                info!(record_id = %record.id, lead_id = %record.lead_id, "Backlog replay succeeded");
                Ok(true)
            }
            Err(e) => {
                let next_count = record.retry_count + 1;
                if !e.is_retryable() || next_count >= self.settings.max_retry {
                    warn!(
                        record_id = %record.id,
                        retry_count = next_count,
                        error = %e,
                        "Backlog replay failed permanently"
                    );
                    sync_records::mark_failed_permanently(
                        &self.db,
                        record.id,
                        &e.to_string(),
                        self.settings.max_retry,
                    )
                    .await?;
                } else {
                    warn!(
                        record_id = %record.id,
                        retry_count = next_count,
                        error = %e,
                        "Backlog replay failed, will retry next sweep"
                    );
                    sync_records::increment_retry(&self.db, record.id, &e.to_string()).await?;
                }
                Ok(false)
            }
        }
    }
}
