//! Stage-change trigger endpoint
//!
//! The lead-update code path calls this whenever a lead's pipeline stage
//! changes. The stage change itself has already been committed by the
//! caller; a sync failure is reported as `synced: false`, never as an HTTP
//! error, so the primary write is never blocked by the platform.

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::db::leads;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Stage change notification
#[derive(Debug, Deserialize)]
pub struct StageChangeRequest {
    pub lead_id: Uuid,
    pub previous_stage: Option<String>,
    pub new_stage: String,
}

/// Sync outcome for the caller
#[derive(Debug, Serialize)]
pub struct StageChangeResponse {
    pub lead_id: Uuid,
    pub synced: bool,
}

/// POST /sync/stage-change
pub async fn stage_change(
    State(state): State<AppState>,
    Json(request): Json<StageChangeRequest>,
) -> ApiResult<Json<StageChangeResponse>> {
    let lead = leads::get_lead(&state.db, request.lead_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", request.lead_id)))?;

    let synced = match state
        .engine
        .reconcile(
            lead.id,
            lead.external_subscriber_id.as_deref(),
            request.previous_stage.as_deref(),
            &request.new_stage,
        )
        .await
    {
        Ok(synced) => synced,
        Err(e) => {
            // Infrastructure failure (ledger write); surface for diagnostics
            // but still answer the caller
            error!(lead_id = %lead.id, error = %e, "Reconciliation infrastructure failure");
            *state.last_error.write().await = Some(e.to_string());
            false
        }
    };

    Ok(Json(StageChangeResponse {
        lead_id: lead.id,
        synced,
    }))
}

/// Build sync trigger routes
pub fn sync_routes() -> Router<AppState> {
    Router::new().route("/sync/stage-change", post(stage_change))
}
