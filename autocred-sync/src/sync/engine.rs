//! Reconciliation engine
//!
//! Keeps a lead's pipeline stage consistent with tag state on the external
//! messaging platform. The platform is the source of truth for live tags
//! (platform-side automations drift them), so every attempt re-fetches the
//! subscriber and recomputes the delta; nothing is cached.
//!
//! Sequencing inside one reconciliation is a correctness requirement: the
//! platform's automation engine is edge-sensitive, so the remove phase fully
//! completes (including the settling delay) before the add phase starts.

use crate::db::sync_records;
use crate::platform::{detect_channel, LookupIdentifiers, PlatformApi, PlatformError, Tag};
use crate::tags::{normalize_tag, TagDirectory};
use autocred_common::Result;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SYNC_TYPE_STAGE_TAG: &str = "stage_tag_sync";
pub const DIRECTION_OUTBOUND: &str = "outbound";

/// Custom field carrying the subscriber's detected channel, so platform
/// automation rules can filter flows by origin.
const CHANNEL_FIELD: &str = "canal";

/// Reconciliation failure for one attempt
#[derive(Debug, Error)]
pub enum SyncError {
    /// Stage has no active pipeline mapping (configuration gap)
    #[error("No active pipeline mapping for stage {0}")]
    UnmappedStage(String),

    /// Subscriber unknown to the platform; the lead is unreachable there.
    /// Terminal: no amount of waiting fixes a nonexistent subscriber.
    #[error("Subscriber {0} not found on platform")]
    SubscriberNotFound(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::UnmappedStage(_) => false,
            SyncError::SubscriberNotFound(_) => false,
            SyncError::Platform(e) => e.is_retryable(),
        }
    }
}

/// Computed tag delta. Transient: recomputed from live platform state on
/// every attempt, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDelta {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

/// Compute the minimal delta against the subscriber's live tag set.
///
/// Removes every pipeline tag except the target (drift may have left several
/// stale ones); business and unrecognized tags are never touched. The target
/// tag is always in `to_add`, even when already present: the platform only
/// fires automations on tag-added events, so re-entering a stage must
/// re-assert its tag.
pub fn compute_delta(live_tags: &[Tag], directory: &TagDirectory, new_tag: &str) -> TagDelta {
    let target = normalize_tag(new_tag);
    let mut seen = HashSet::new();
    let mut to_remove = Vec::new();

    for tag in live_tags {
        let normalized = normalize_tag(&tag.name);
        if normalized == target {
            continue;
        }
        if directory.is_pipeline_tag(&tag.name) && seen.insert(normalized) {
            to_remove.push(tag.name.clone());
        }
    }

    TagDelta {
        to_add: vec![new_tag.to_string()],
        to_remove,
    }
}

/// What one successful reconciliation did
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub new_tag: String,
    pub previous_tag: Option<String>,
    pub tags_added: Vec<String>,
    pub tags_removed: Vec<String>,
    /// Remove-wait-readd cycle fired for a force_retrigger mapping
    pub retriggered: bool,
    /// Nothing to do; no platform calls were made
    pub already_in_sync: bool,
}

/// Stage → tag reconciliation engine
pub struct ReconciliationEngine<P> {
    platform: P,
    directory: TagDirectory,
    db: SqlitePool,
    /// Delay between the remove phase and the add phase
    settle_delay: Duration,
    /// Ledger retry budget, used to mark terminal failures
    max_retry: u32,
}

impl<P: PlatformApi> ReconciliationEngine<P> {
    pub fn new(
        platform: P,
        directory: TagDirectory,
        db: SqlitePool,
        settle_delay: Duration,
        max_retry: u32,
    ) -> Self {
        Self {
            platform,
            directory,
            db,
            settle_delay,
            max_retry,
        }
    }

    /// Reconcile a lead's stage change against the platform.
    ///
    /// Business conditions (no mapping, lead never linked, subscriber gone)
    /// come back as `Ok(false)` with logging and a ledger record where
    /// actionable; only infrastructure failures (ledger writes) propagate as
    /// `Err`. The caller's stage change must never be blocked by sync.
    pub async fn reconcile(
        &self,
        lead_id: Uuid,
        external_subscriber_id: Option<&str>,
        previous_stage: Option<&str>,
        new_stage: &str,
    ) -> Result<bool> {
        let Some(mapping) = self.directory.resolve(new_stage) else {
            warn!(%lead_id, stage = new_stage, "No active pipeline mapping for stage, skipping sync");
            return Ok(false);
        };

        let Some(subscriber_id) = external_subscriber_id else {
            warn!(%lead_id, "Lead was never linked to the messaging platform, cannot sync");
            let payload = json!({
                "previous_stage": previous_stage,
                "new_stage": new_stage,
                "new_tag": mapping.tag,
            });
            let record_id = sync_records::insert_pending(
                &self.db,
                lead_id,
                SYNC_TYPE_STAGE_TAG,
                DIRECTION_OUTBOUND,
                &payload,
            )
            .await?;
            sync_records::mark_failed_permanently(
                &self.db,
                record_id,
                "lead not linked to platform",
                self.max_retry,
            )
            .await?;
            return Ok(false);
        };

        let payload = json!({
            "previous_stage": previous_stage,
            "new_stage": new_stage,
            "new_tag": mapping.tag,
            "subscriber_id": subscriber_id,
        });
        let record_id = sync_records::insert_pending(
            &self.db,
            lead_id,
            SYNC_TYPE_STAGE_TAG,
            DIRECTION_OUTBOUND,
            &payload,
        )
        .await?;

        match self
            .apply_stage_change(subscriber_id, previous_stage, new_stage)
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
                });
                sync_records::mark_success(&self.db, record_id, &payload).await?;
                info!(
                    %lead_id,
                    from = ?previous_stage,
                    to = new_stage,
                    tag = %outcome.new_tag,
                    "Stage tag sync complete"
                );
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                warn!(%lead_id, stage = new_stage, error = %e, "Stage tag sync failed, queued for backlog retry");
                sync_records::mark_failed(&self.db, record_id, &e.to_string()).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(%lead_id, stage = new_stage, error = %e, "Stage tag sync failed permanently");
                sync_records::mark_failed_permanently(
                    &self.db,
                    record_id,
                    &e.to_string(),
                    self.max_retry,
                )
                .await?;
                Ok(false)
            }
        }
    }

    /// The core tag-apply step: fetch live state, compute the delta, apply
    /// removals, settle, apply the add, and run the forced re-trigger cycle
    /// where the mapping demands it. Shared by [`reconcile`] and the backlog
    /// processor's replays.
    ///
    /// [`reconcile`]: ReconciliationEngine::reconcile
    pub async fn apply_stage_change(
        &self,
        subscriber_id: &str,
        previous_stage: Option<&str>,
        new_stage: &str,
    ) -> std::result::Result<SyncOutcome, SyncError> {
        let mapping = self
            .directory
            .resolve(new_stage)
            .ok_or_else(|| SyncError::UnmappedStage(new_stage.to_string()))?;

        let previous_tag = previous_stage
            .and_then(|s| self.directory.resolve(s))
            .map(|m| m.tag.clone());
        if let Some(stage) = previous_stage {
            if previous_tag.is_none() {
                debug!(stage, "Previous stage has no mapping");
            }
        }

        // Live platform state, never a cached tag list
        let subscriber = self
            .platform
            .find_subscriber(&LookupIdentifiers::by_id(subscriber_id))
            .await?
            .ok_or_else(|| SyncError::SubscriberNotFound(subscriber_id.to_string()))?;

        let already_present = subscriber.has_tag(&mapping.tag);
        let delta = compute_delta(&subscriber.tags, &self.directory, &mapping.tag);

        if delta.to_remove.is_empty() && already_present && !mapping.force_retrigger {
            debug!(subscriber_id, tag = %mapping.tag, "Already in sync, skipping platform calls");
            return Ok(SyncOutcome {
                new_tag: mapping.tag.clone(),
                previous_tag,
                tags_added: Vec::new(),
                tags_removed: Vec::new(),
                retriggered: false,
                already_in_sync: true,
            });
        }

        // Channel field first, so automation rules triggered by the tag-added
        // event can already filter on it. Non-fatal.
        let channel = detect_channel(&subscriber);
        if let Err(e) = self
            .platform
            .set_custom_field(&subscriber.id, CHANNEL_FIELD, channel.as_str())
            .await
        {
            warn!(subscriber_id, error = %e, "Failed to set channel custom field, continuing");
        }

        for tag in &delta.to_remove {
            self.platform.remove_tag(&subscriber.id, tag).await?;
        }
        if !delta.to_remove.is_empty() {
            // The automation engine needs the removals to settle before the
            // add event arrives
            tokio::time::sleep(self.settle_delay).await;
        }

        self.platform.add_tag(&subscriber.id, &mapping.tag).await?;

        // Adding a tag that is already live may not produce a fresh
        // tag-added event; flagged mappings get a remove-wait-readd cycle.
        let retriggered = mapping.force_retrigger && already_present;
        if retriggered {
            debug!(subscriber_id, tag = %mapping.tag, "Forced re-trigger cycle");
            self.platform.remove_tag(&subscriber.id, &mapping.tag).await?;
            tokio::time::sleep(self.settle_delay).await;
            self.platform.add_tag(&subscriber.id, &mapping.tag).await?;
        }

        Ok(SyncOutcome {
            new_tag: mapping.tag.clone(),
            previous_tag,
            tags_added: delta.to_add,
            tags_removed: delta.to_remove,
            retriggered,
            already_in_sync: false,
        })
    }
}
