//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every ledger write is a single
//! conditional `UPDATE`, so a transition either lands whole or not at all.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::outreach::model::{
    Credential, CredentialKind, ImapSettings, NewCredential, NewRecipient, NewTemplate, Recipient,
    RecipientStatus, SmtpSettings, StatusCounts, Template, Transition,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_recipients(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Recipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut recipients = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_recipient(&row) {
                Ok(r) => recipients.push(r),
                Err(e) => warn!("Skipping recipient row: {e}"),
            }
        }
        Ok(recipients)
    }

    async fn get_template(&self, id: i64) -> Result<Option<Template>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_template(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_template: {e}"))),
        }
    }

    async fn get_credential(&self, id: i64) -> Result<Option<Credential>, DatabaseError> {
        self.query_credential(
            "get_credential",
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?1"),
            params![id],
        )
        .await
    }

    async fn query_credential(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Credential>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_credential(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    /// Read the `id` produced by an `INSERT ... RETURNING id`.
    async fn returning_id(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| map_write_error(op, e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| map_write_error(op, e))?
            .ok_or_else(|| DatabaseError::Query(format!("{op}: no id returned")))?;
        row.get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width UTC so that text comparison in SQL
/// orders the same as time.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(i: Option<i64>) -> libsql::Value {
    match i {
        Some(i) => libsql::Value::Integer(i),
        None => libsql::Value::Null,
    }
}

/// Map a failed write, surfacing unique-constraint violations.
fn map_write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const RECIPIENT_COLUMNS: &str = "id, email, name, company, status, first_email_sent_at, first_email_message_id, second_email_sent_at, second_email_message_id, responded_at, response_body, bounced_at, bounce_reason, created_at, updated_at";

const TEMPLATE_COLUMNS: &str =
    "id, name, active, subject, body, sender_name, sender_company, updated_at";

const CREDENTIAL_COLUMNS: &str = "id, email, type, smtp_host, smtp_port, smtp_user, smtp_password, imap_host, imap_port, imap_user, imap_password, tls, auth_timeout_ms";

/// A row is free to claim when it has no claim or the lease has run out.
const CLAIM_FREE: &str = "(claimed_until IS NULL OR claimed_until < ?1)";

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Serialization(format!("row parse: {e}"))
}

fn row_to_recipient(row: &libsql::Row) -> Result<Recipient, DatabaseError> {
    let status_str: String = row.get(4).map_err(row_err)?;
    let status = status_str
        .parse::<RecipientStatus>()
        .map_err(DatabaseError::Serialization)?;
    let created_str: String = row.get(13).map_err(row_err)?;
    let updated_str: String = row.get(14).map_err(row_err)?;

    Ok(Recipient {
        id: row.get(0).map_err(row_err)?,
        email: row.get(1).map_err(row_err)?,
        name: row.get(2).ok(),
        company: row.get(3).ok(),
        status,
        first_email_sent_at: parse_optional_datetime(&row.get(5).ok()),
        first_email_message_id: row.get(6).ok(),
        second_email_sent_at: parse_optional_datetime(&row.get(7).ok()),
        second_email_message_id: row.get(8).ok(),
        responded_at: parse_optional_datetime(&row.get(9).ok()),
        response_body: row.get(10).ok(),
        bounced_at: parse_optional_datetime(&row.get(11).ok()),
        bounce_reason: row.get(12).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_template(row: &libsql::Row) -> Result<Template, DatabaseError> {
    let active: i64 = row.get(2).map_err(row_err)?;
    let updated_str: String = row.get(7).map_err(row_err)?;
    Ok(Template {
        id: row.get(0).map_err(row_err)?,
        name: row.get(1).map_err(row_err)?,
        active: active != 0,
        subject: row.get(3).map_err(row_err)?,
        body: row.get(4).map_err(row_err)?,
        sender_name: row.get(5).ok(),
        sender_company: row.get(6).ok(),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_credential(row: &libsql::Row) -> Result<Credential, DatabaseError> {
    let kind_str: String = row.get(2).map_err(row_err)?;
    let kind = kind_str
        .parse::<CredentialKind>()
        .map_err(DatabaseError::Serialization)?;
    let smtp_port: i64 = row.get(4).map_err(row_err)?;

    let imap_host: Option<String> = row.get(7).ok();
    let imap = match imap_host {
        Some(host) if !host.is_empty() => Some(ImapSettings {
            host,
            port: row
                .get::<i64>(8)
                .ok()
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(993),
            user: row.get(9).unwrap_or_default(),
            password: row.get(10).unwrap_or_default(),
        }),
        _ => None,
    };

    let tls: i64 = row.get(11).map_err(row_err)?;
    let auth_timeout_ms: i64 = row.get(12).map_err(row_err)?;

    Ok(Credential {
        id: row.get(0).map_err(row_err)?,
        email: row.get(1).map_err(row_err)?,
        kind,
        smtp: SmtpSettings {
            host: row.get(3).map_err(row_err)?,
            port: u16::try_from(smtp_port).unwrap_or(587),
            user: row.get(5).map_err(row_err)?,
            password: row.get(6).map_err(row_err)?,
        },
        imap,
        tls: tls != 0,
        auth_timeout: Duration::from_millis(u64::try_from(auth_timeout_ms).unwrap_or(0)),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Recipients ──────────────────────────────────────────────────

    async fn insert_recipient(&self, recipient: &NewRecipient) -> Result<Recipient, DatabaseError> {
        let recipient = recipient.normalized();
        let now = ts(Utc::now());

        let id = self
            .returning_id(
                "insert_recipient",
                "INSERT INTO recipients (email, name, company, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?4) RETURNING id",
                params![
                    recipient.email.clone(),
                    opt_text(recipient.name.as_deref()),
                    opt_text(recipient.company.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| match e {
                DatabaseError::Constraint(_) => DatabaseError::DuplicateEmail(recipient.email.clone()),
                other => other,
            })?;

        debug!(recipient_id = id, email = %recipient.email, "Recipient inserted");
        self.get_recipient(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "recipient".into(),
                id: id.to_string(),
            })
    }

    async fn get_recipient(&self, id: i64) -> Result<Option<Recipient>, DatabaseError> {
        let mut found = self
            .query_recipients(
                "get_recipient",
                &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_recipients(&self) -> Result<Vec<Recipient>, DatabaseError> {
        self.query_recipients(
            "list_recipients",
            &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients ORDER BY id ASC"),
            (),
        )
        .await
    }

    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM recipients GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;

        let mut counts = StatusCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            match status_str.parse::<RecipientStatus>() {
                Ok(status) => counts.add(status, count.max(0) as u64),
                Err(e) => warn!("Ignoring count for {e}"),
            }
        }
        Ok(counts)
    }

    async fn find_eligible_for_first_send(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>, DatabaseError> {
        let mut found = self
            .query_recipients(
                "find_eligible_for_first_send",
                &format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM recipients
                     WHERE status = 'pending' AND bounced_at IS NULL AND {CLAIM_FREE}
                     ORDER BY id ASC LIMIT 1"
                ),
                params![ts(now)],
            )
            .await?;
        Ok(found.pop())
    }

    async fn find_eligible_for_follow_up(
        &self,
        threshold: DateTime<Utc>,
        skip_wait: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>, DatabaseError> {
        let mut found = self
            .query_recipients(
                "find_eligible_for_follow_up",
                &format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM recipients
                     WHERE status IN ('first_sent', 'responded')
                       AND bounced_at IS NULL
                       AND second_email_sent_at IS NULL
                       AND {CLAIM_FREE}
                       AND (?2 = 1 OR (first_email_sent_at IS NOT NULL AND first_email_sent_at < ?3))
                     ORDER BY first_email_sent_at ASC, id ASC LIMIT 1"
                ),
                params![ts(now), skip_wait as i64, ts(threshold)],
            )
            .await?;
        Ok(found.pop())
    }

    async fn find_respondable_candidates(&self) -> Result<Vec<Recipient>, DatabaseError> {
        self.query_recipients(
            "find_respondable_candidates",
            &format!(
                "SELECT {RECIPIENT_COLUMNS} FROM recipients
                 WHERE first_email_message_id IS NOT NULL
                   AND status != 'responded'
                   AND bounced_at IS NULL
                 ORDER BY id ASC"
            ),
            (),
        )
        .await
    }

    async fn claim_recipient(
        &self,
        id: i64,
        expected: RecipientStatus,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE recipients SET claimed_until = ?2
                     WHERE id = ?3 AND status = ?4 AND bounced_at IS NULL
                       AND second_email_sent_at IS NULL AND {CLAIM_FREE}"
                ),
                params![ts(now), ts(until), id, expected.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_recipient: {e}")))?;

        debug!(recipient_id = id, claimed = changed == 1, "Claim attempted");
        Ok(changed == 1)
    }

    async fn release_claim(&self, id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE recipients SET claimed_until = NULL WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;
        Ok(())
    }

    async fn apply_transition(
        &self,
        id: i64,
        transition: &Transition,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let result = match transition {
            Transition::FirstSent { message_id, at } => {
                conn.execute(
                    "UPDATE recipients
                     SET status = 'first_sent', first_email_sent_at = ?2,
                         first_email_message_id = ?3, updated_at = ?2, claimed_until = NULL
                     WHERE id = ?1 AND status = 'pending' AND bounced_at IS NULL",
                    params![id, ts(*at), message_id.clone()],
                )
                .await
            }
            Transition::SecondSent { message_id, at } => {
                conn.execute(
                    "UPDATE recipients
                     SET status = 'second_sent', second_email_sent_at = ?2,
                         second_email_message_id = ?3, updated_at = ?2, claimed_until = NULL
                     WHERE id = ?1 AND status IN ('first_sent', 'responded')
                       AND second_email_sent_at IS NULL AND bounced_at IS NULL",
                    params![id, ts(*at), message_id.clone()],
                )
                .await
            }
            Transition::Responded { body, at } => {
                conn.execute(
                    "UPDATE recipients
                     SET status = 'responded', responded_at = ?2, response_body = ?3,
                         updated_at = ?2, claimed_until = NULL
                     WHERE id = ?1 AND first_email_message_id IS NOT NULL
                       AND responded_at IS NULL AND status != 'responded'
                       AND bounced_at IS NULL",
                    params![id, ts(*at), body.clone()],
                )
                .await
            }
            Transition::Bounced { reason, at } => {
                conn.execute(
                    "UPDATE recipients
                     SET status = 'bounced', bounced_at = ?2, bounce_reason = ?3,
                         updated_at = ?2, claimed_until = NULL
                     WHERE id = ?1 AND bounced_at IS NULL AND status != 'responded'",
                    params![id, ts(*at), reason.clone()],
                )
                .await
            }
        };

        let changed =
            result.map_err(|e| DatabaseError::Query(format!("apply_transition: {e}")))?;
        if changed == 1 {
            info!(
                recipient_id = id,
                status = %transition.target_status(),
                "Recipient transitioned"
            );
        } else {
            debug!(
                recipient_id = id,
                status = %transition.target_status(),
                "Transition not applicable"
            );
        }
        Ok(changed == 1)
    }

    // ── Templates ───────────────────────────────────────────────────

    async fn upsert_template(
        &self,
        id: Option<i64>,
        template: &NewTemplate,
    ) -> Result<Template, DatabaseError> {
        let now = ts(Utc::now());
        // Rows are written inactive; activation is a separate single statement
        // so that two active rows for one name are never visible.
        let id = match id {
            Some(id) => {
                let changed = self
                    .conn()
                    .execute(
                        "UPDATE templates
                         SET name = ?2, subject = ?3, body = ?4, sender_name = ?5,
                             sender_company = ?6, updated_at = ?7,
                             active = CASE WHEN ?8 = 1 THEN active ELSE 0 END
                         WHERE id = ?1",
                        params![
                            id,
                            template.name.clone(),
                            template.subject.clone(),
                            template.body.clone(),
                            opt_text(template.sender_name.as_deref()),
                            opt_text(template.sender_company.as_deref()),
                            now,
                            template.active as i64,
                        ],
                    )
                    .await
                    .map_err(|e| map_write_error("upsert_template", e))?;
                if changed == 0 {
                    return Err(DatabaseError::NotFound {
                        entity: "template".into(),
                        id: id.to_string(),
                    });
                }
                id
            }
            None => {
                self.returning_id(
                    "upsert_template",
                    "INSERT INTO templates (name, active, subject, body, sender_name, sender_company, updated_at)
                     VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6) RETURNING id",
                    params![
                        template.name.clone(),
                        template.subject.clone(),
                        template.body.clone(),
                        opt_text(template.sender_name.as_deref()),
                        opt_text(template.sender_company.as_deref()),
                        now,
                    ],
                )
                .await?
            }
        };

        if template.active {
            return self.activate_template(id).await;
        }

        self.get_template(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "template".into(),
                id: id.to_string(),
            })
    }

    async fn activate_template(&self, id: i64) -> Result<Template, DatabaseError> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE templates
                 SET active = CASE WHEN id = ?1 THEN 1 ELSE 0 END,
                     updated_at = CASE WHEN id = ?1 THEN ?2 ELSE updated_at END
                 WHERE name = (SELECT name FROM templates WHERE id = ?1)",
                params![id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("activate_template: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "template".into(),
                id: id.to_string(),
            });
        }

        let template = self
            .get_template(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "template".into(),
                id: id.to_string(),
            })?;
        info!(template_id = id, name = %template.name, "Template activated");
        Ok(template)
    }

    async fn active_template(&self, name: &str) -> Result<Option<Template>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM templates
                     WHERE name = ?1 AND active = 1 ORDER BY id DESC LIMIT 1"
                ),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_template(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("active_template: {e}"))),
        }
    }

    async fn list_templates(&self) -> Result<Vec<Template>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates ORDER BY name ASC, id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_templates: {e}")))?;

        let mut templates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_template(&row) {
                Ok(t) => templates.push(t),
                Err(e) => warn!("Skipping template row: {e}"),
            }
        }
        Ok(templates)
    }

    // ── Credentials ─────────────────────────────────────────────────

    async fn upsert_credential(
        &self,
        id: Option<i64>,
        credential: &NewCredential,
    ) -> Result<Credential, DatabaseError> {
        let now = ts(Utc::now());
        let imap = credential.imap.as_ref();
        let email = credential.email.trim().to_lowercase();
        let auth_timeout_ms = credential.auth_timeout.as_millis() as i64;

        let id = match id {
            Some(id) => {
                let changed = self
                    .conn()
                    .execute(
                        "UPDATE credentials
                         SET email = ?2, type = ?3, smtp_host = ?4, smtp_port = ?5, smtp_user = ?6,
                             smtp_password = ?7, imap_host = ?8, imap_port = ?9, imap_user = ?10,
                             imap_password = ?11, tls = ?12, auth_timeout_ms = ?13, updated_at = ?14
                         WHERE id = ?1",
                        params![
                            id,
                            email,
                            credential.kind.as_str(),
                            credential.smtp.host.clone(),
                            credential.smtp.port as i64,
                            credential.smtp.user.clone(),
                            credential.smtp.password.clone(),
                            opt_text(imap.map(|i| i.host.as_str())),
                            opt_int(imap.map(|i| i.port as i64)),
                            opt_text(imap.map(|i| i.user.as_str())),
                            opt_text(imap.map(|i| i.password.as_str())),
                            credential.tls as i64,
                            auth_timeout_ms,
                            now,
                        ],
                    )
                    .await
                    .map_err(|e| map_write_error("upsert_credential", e))?;
                if changed == 0 {
                    return Err(DatabaseError::NotFound {
                        entity: "credential".into(),
                        id: id.to_string(),
                    });
                }
                id
            }
            None => {
                self.returning_id(
                    "upsert_credential",
                    "INSERT INTO credentials (email, type, smtp_host, smtp_port, smtp_user, smtp_password,
                         imap_host, imap_port, imap_user, imap_password, tls, auth_timeout_ms, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) RETURNING id",
                    params![
                        email,
                        credential.kind.as_str(),
                        credential.smtp.host.clone(),
                        credential.smtp.port as i64,
                        credential.smtp.user.clone(),
                        credential.smtp.password.clone(),
                        opt_text(imap.map(|i| i.host.as_str())),
                        opt_int(imap.map(|i| i.port as i64)),
                        opt_text(imap.map(|i| i.user.as_str())),
                        opt_text(imap.map(|i| i.password.as_str())),
                        credential.tls as i64,
                        auth_timeout_ms,
                        now,
                    ],
                )
                .await?
            }
        };

        info!(credential_id = id, kind = %credential.kind, "Credential saved");
        self.get_credential(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "credential".into(),
                id: id.to_string(),
            })
    }

    async fn select_credential(
        &self,
        kind: CredentialKind,
    ) -> Result<Option<Credential>, DatabaseError> {
        self.query_credential(
            "select_credential",
            &format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials
                 ORDER BY CASE WHEN type = ?1 THEN 0 ELSE 1 END, id ASC LIMIT 1"
            ),
            params![kind.as_str()],
        )
        .await
    }

    async fn credential_by_email(&self, email: &str) -> Result<Option<Credential>, DatabaseError> {
        self.query_credential(
            "credential_by_email",
            &format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE email = ?1 ORDER BY id ASC LIMIT 1"
            ),
            params![email.trim().to_lowercase()],
        )
        .await
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials ORDER BY id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_credentials: {e}")))?;

        let mut credentials = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_credential(&row) {
                Ok(c) => credentials.push(c),
                Err(e) => warn!("Skipping credential row: {e}"),
            }
        }
        Ok(credentials)
    }
}
