//! Lead intake routes.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use super::{ApiError, AppState, CronAuth, secret_matches};
use crate::outreach::intake::{ImportReport, LeadSubmission, import_leads, submit_lead};

/// POST /api/submit
///
/// Public form endpoint guarded by the submission secret in the body.
pub async fn submit(
    State(state): State<AppState>,
    Json(submission): Json<LeadSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let presented = submission.secret.as_deref().map(str::trim).unwrap_or_default();
    if !secret_matches(presented, &state.submission_secret) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid secret phrase. Access denied.",
        ));
    }

    let recipient = submit_lead(state.db.as_ref(), &submission).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Lead submitted successfully",
            "id": recipient.id,
        })),
    ))
}

/// POST /api/recipients/import
///
/// Plain-text body, one `name,email[,company]` per line.
pub async fn import(
    _auth: CronAuth,
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ImportReport>, ApiError> {
    Ok(Json(import_leads(state.db.as_ref(), &body).await?))
}
