//! Unified `Database` trait: single async interface for the recipient ledger,
//! templates and credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::outreach::model::{
    Credential, CredentialKind, NewCredential, NewRecipient, NewTemplate, Recipient,
    RecipientStatus, StatusCounts, Template, Transition,
};

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Recipients ──────────────────────────────────────────────────

    /// Insert a new `pending` recipient. The email is stored normalized.
    ///
    /// Fails with `DatabaseError::DuplicateEmail` if the address exists.
    async fn insert_recipient(&self, recipient: &NewRecipient) -> Result<Recipient, DatabaseError>;

    /// Get a recipient by ID.
    async fn get_recipient(&self, id: i64) -> Result<Option<Recipient>, DatabaseError>;

    /// All recipients, oldest first.
    async fn list_recipients(&self) -> Result<Vec<Recipient>, DatabaseError>;

    /// Count recipients per status.
    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError>;

    /// The oldest `pending`, never-bounced recipient without a live claim.
    async fn find_eligible_for_first_send(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>, DatabaseError>;

    /// The earliest-sent `first_sent`/`responded` recipient that is not bounced,
    /// has no follow-up yet, has no live claim, and (unless `skip_wait`) had its
    /// first email sent before `threshold`.
    async fn find_eligible_for_follow_up(
        &self,
        threshold: DateTime<Utc>,
        skip_wait: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>, DatabaseError>;

    /// Recipients to scan for replies and bounces: first email sent, not yet
    /// responded, never bounced.
    async fn find_respondable_candidates(&self) -> Result<Vec<Recipient>, DatabaseError>;

    /// Claim a recipient until `until`, provided its status is still `expected`,
    /// it is not bounced, and no other claim is live at `now`.
    ///
    /// Returns `false` when another invocation got there first.
    async fn claim_recipient(
        &self,
        id: i64,
        expected: RecipientStatus,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Drop a claim without changing anything else.
    async fn release_claim(&self, id: i64) -> Result<(), DatabaseError>;

    /// Apply a transition as one conditional row update. The claim is cleared.
    ///
    /// Returns `false` if the recipient's current state does not allow it.
    async fn apply_transition(&self, id: i64, transition: &Transition)
    -> Result<bool, DatabaseError>;

    // ── Templates ───────────────────────────────────────────────────

    /// Insert (`id = None`) or update a template. Saving it as active
    /// deactivates every other template with the same name.
    async fn upsert_template(
        &self,
        id: Option<i64>,
        template: &NewTemplate,
    ) -> Result<Template, DatabaseError>;

    /// Make a template the only active one for its name.
    async fn activate_template(&self, id: i64) -> Result<Template, DatabaseError>;

    /// The active template for a stage name, if any.
    async fn active_template(&self, name: &str) -> Result<Option<Template>, DatabaseError>;

    /// All templates.
    async fn list_templates(&self) -> Result<Vec<Template>, DatabaseError>;

    // ── Credentials ─────────────────────────────────────────────────

    /// Insert (`id = None`) or update a credential.
    async fn upsert_credential(
        &self,
        id: Option<i64>,
        credential: &NewCredential,
    ) -> Result<Credential, DatabaseError>;

    /// Oldest credential of `kind`, falling back to the oldest of any kind.
    async fn select_credential(
        &self,
        kind: CredentialKind,
    ) -> Result<Option<Credential>, DatabaseError>;

    /// Credential for a mailbox address.
    async fn credential_by_email(&self, email: &str) -> Result<Option<Credential>, DatabaseError>;

    /// All credentials.
    async fn list_credentials(&self) -> Result<Vec<Credential>, DatabaseError>;
}
