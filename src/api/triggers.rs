//! Trigger routes invoked by an external cron or the in-process scheduler.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use tracing::info;

use super::{ApiError, AppState, CronAuth, lenient_json};
use crate::outreach::dispatch::{FirstSendReport, FollowUpOptions, FollowUpReport};
use crate::outreach::reconcile::ReconcileReport;

/// POST /api/send-warmup
pub async fn send_warmup(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<FirstSendReport>, ApiError> {
    info!("First-send triggered");
    Ok(Json(state.dispatch.first_send().await?))
}

/// POST /api/send-followup
///
/// Body `{waitDays?, skipWait?}`; empty or invalid JSON means defaults.
pub async fn send_followup(
    _auth: CronAuth,
    State(state): State<AppState>,
    body: String,
) -> Result<Json<FollowUpReport>, ApiError> {
    let options: FollowUpOptions = lenient_json(&body);
    info!(wait_days = ?options.wait_days, skip_wait = options.skip_wait, "Follow-up triggered");
    Ok(Json(state.dispatch.follow_up(&options).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckResponsesRequest {
    #[serde(default, alias = "mailboxEmail")]
    pub email: Option<String>,
}

/// POST /api/check-responses
///
/// Body `{email?}` names the mailbox to scan; otherwise the warmup mailbox.
pub async fn check_responses(
    _auth: CronAuth,
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ReconcileReport>, ApiError> {
    let request: CheckResponsesRequest = lenient_json(&body);
    info!(mailbox = ?request.email, "Reconciliation triggered");
    Ok(Json(state.reconciler.reconcile(request.email.as_deref()).await?))
}
