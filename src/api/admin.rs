//! Operator API: ledger views, templates and credentials.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, AppState, CronAuth};
use crate::outreach::model::{Credential, NewCredential, NewTemplate, Recipient, StatusCounts, Template};

/// Upsert body: the entity's fields plus an optional `id` to update.
#[derive(Debug, Deserialize)]
pub struct Upsert<T> {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(flatten)]
    pub fields: T,
}

/// GET /api/recipients
pub async fn list_recipients(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<Vec<Recipient>>, ApiError> {
    Ok(Json(state.db.list_recipients().await?))
}

/// GET /api/recipients/{id}
pub async fn get_recipient(
    _auth: CronAuth,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Recipient>, ApiError> {
    state
        .db
        .get_recipient(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Recipient {id} not found")))
}

/// GET /api/stats
pub async fn stats(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<StatusCounts>, ApiError> {
    Ok(Json(state.db.status_counts().await?))
}

/// GET /api/templates
pub async fn list_templates(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<Vec<Template>>, ApiError> {
    Ok(Json(state.db.list_templates().await?))
}

/// POST /api/templates
///
/// `active: true` also deactivates every other version with the same name.
pub async fn upsert_template(
    _auth: CronAuth,
    State(state): State<AppState>,
    Json(body): Json<Upsert<NewTemplate>>,
) -> Result<Json<Template>, ApiError> {
    if body.fields.name.trim().is_empty() {
        return Err(ApiError::bad_request("Template name is required"));
    }
    let template = state.db.upsert_template(body.id, &body.fields).await?;
    info!(template_id = template.id, name = %template.name, active = template.active, "Template saved");
    Ok(Json(template))
}

/// POST /api/templates/{id}/activate
pub async fn activate_template(
    _auth: CronAuth,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Template>, ApiError> {
    let template = state.db.activate_template(id).await?;
    info!(template_id = id, name = %template.name, "Template activated");
    Ok(Json(template))
}

/// GET /api/credentials
///
/// Passwords are never serialised.
pub async fn list_credentials(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<Vec<Credential>>, ApiError> {
    Ok(Json(state.db.list_credentials().await?))
}

/// POST /api/credentials
pub async fn upsert_credential(
    _auth: CronAuth,
    State(state): State<AppState>,
    Json(body): Json<Upsert<NewCredential>>,
) -> Result<Json<Credential>, ApiError> {
    let email = body.fields.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::bad_request("Credential email must be an address"));
    }
    let credential = state.db.upsert_credential(body.id, &body.fields).await?;
    info!(credential_id = credential.id, email = %credential.email, kind = %credential.kind, "Credential saved");
    Ok(Json(credential))
}
