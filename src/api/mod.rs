//! HTTP surface: trigger routes, lead intake and the operator API.

pub mod admin;
pub mod leads;
pub mod triggers;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::{DatabaseError, DispatchError, IntakeError, ReconcileError};
use crate::outreach::{DispatchEngine, MailboxReconciler};
use crate::store::Database;

/// Header carrying the trigger/operator secret.
pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub dispatch: Arc<DispatchEngine>,
    pub reconciler: Arc<MailboxReconciler>,
    pub cron_secret: SecretString,
    pub submission_secret: SecretString,
}

/// Build the full router.
pub fn outreach_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/send-warmup", post(triggers::send_warmup))
        .route("/api/send-followup", post(triggers::send_followup))
        .route("/api/check-responses", post(triggers::check_responses))
        .route("/api/submit", post(leads::submit))
        .route("/api/recipients/import", post(leads::import))
        .route("/api/recipients", get(admin::list_recipients))
        .route("/api/recipients/{id}", get(admin::get_recipient))
        .route("/api/stats", get(admin::stats))
        .route(
            "/api/templates",
            get(admin::list_templates).post(admin::upsert_template),
        )
        .route("/api/templates/{id}/activate", post(admin::activate_template))
        .route(
            "/api/credentials",
            get(admin::list_credentials).post(admin::upsert_credential),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "outreach-sequencer"
    }))
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error body `{"error": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "{}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => Self::not_found(e.to_string()),
            DatabaseError::DuplicateEmail(_) | DatabaseError::Constraint(_) => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::NoCredential | ReconcileError::IncompleteCredential { .. } => {
                Self::bad_request(e.to_string())
            }
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::MissingEmail | IntakeError::InvalidEmail { .. } => {
                Self::bad_request(e.to_string())
            }
            IntakeError::Duplicate(_) => {
                Self::new(StatusCode::CONFLICT, "This email is already registered.")
            }
            IntakeError::Database(e) => e.into(),
        }
    }
}

// ── Auth ────────────────────────────────────────────────────────────────

/// Compare a presented secret against the configured one without
/// short-circuiting on the first differing byte.
pub fn secret_matches(presented: &str, expected: &SecretString) -> bool {
    let expected = expected.expose_secret().as_bytes();
    let presented = presented.as_bytes();
    if expected.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Extractor that rejects requests without the `x-cron-secret` header.
pub struct CronAuth;

impl FromRequestParts<AppState> for CronAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(CRON_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if secret_matches(presented, &state.cron_secret) {
            Ok(CronAuth)
        } else {
            warn!(path = %parts.uri.path(), "Rejected request with bad cron secret");
            Err(ApiError::unauthorized())
        }
    }
}

/// Parse an optional JSON body; empty or malformed input yields the default.
pub fn lenient_json<T: DeserializeOwned + Default>(body: &str) -> T {
    if body.trim().is_empty() {
        return T::default();
    }
    serde_json::from_str(body).unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring unparsable request body");
        T::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outreach::dispatch::FollowUpOptions;

    #[test]
    fn secret_comparison() {
        let secret = SecretString::from("s3cret");
        assert!(secret_matches("s3cret", &secret));
        assert!(!secret_matches("s3cre", &secret));
        assert!(!secret_matches("S3cret", &secret));
        assert!(!secret_matches("", &SecretString::from("")));
    }

    #[test]
    fn lenient_body_parsing() {
        let opts: FollowUpOptions = lenient_json("");
        assert!(opts.wait_days.is_none());
        let opts: FollowUpOptions = lenient_json("{not json");
        assert!(!opts.skip_wait);
        let opts: FollowUpOptions = lenient_json(r#"{"skipWait": true}"#);
        assert!(opts.skip_wait);
    }

    #[test]
    fn error_status_mapping() {
        let e: ApiError = ReconcileError::NoCredential.into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        let e: ApiError = IntakeError::Duplicate("a@x.com".into()).into();
        assert_eq!(e.status, StatusCode::CONFLICT);
        let e: ApiError = DispatchError::NoActiveTemplate { name: "firstEmail".into() }.into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
