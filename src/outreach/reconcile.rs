//! Mailbox reconciler: detects bounces and threaded replies in one mailbox
//! and records them on the ledger.
//!
//! Two independent passes over unseen mail: bounce notifications first, then
//! replies per candidate. Every message a search returns is marked seen, which
//! is what keeps the next run from evaluating it again.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::model::{Credential, CredentialKind, Recipient, Transition, normalize_email};
use crate::error::{MailboxError, ReconcileError};
use crate::mail::{FetchedMessage, MailboxConnector, MailboxSession, SearchCriteria};
use crate::store::Database;

/// Longest reply excerpt stored on the ledger, in characters.
pub const RESPONSE_EXCERPT_CHARS: usize = 1000;

/// Bounce reason prefix.
pub const BOUNCE_REASON: &str = "Auto-detected bounce";

static EMAIL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._-]+@[a-zA-Z0-9._-]+\.[a-zA-Z0-9_-]+").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Bounce,
    Response,
}

/// One ledger change made by a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileDetail {
    #[serde(rename = "type")]
    pub outcome: Outcome,
    pub email: String,
}

/// Result of a reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub message: String,
    pub mailbox: String,
    pub responses_found: u32,
    pub bounces_found: u32,
    pub details: Vec<ReconcileDetail>,
    /// Passes or candidates that failed and were skipped.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// First address-shaped token in a bounce body, lower-cased.
pub fn bounced_address(body: &str) -> Option<String> {
    let lower = body.to_lowercase();
    EMAIL_TOKEN.find(&lower).map(|m| m.as_str().to_string())
}

/// Whether a message is a reply threaded onto `first_message_id`.
pub fn is_threaded_reply(message: &FetchedMessage, first_message_id: &str) -> bool {
    if first_message_id.is_empty() {
        return false;
    }
    message.in_reply_to.as_deref() == Some(first_message_id)
        || message
            .references
            .as_deref()
            .is_some_and(|refs| refs.contains(first_message_id))
}

fn excerpt(body: &str) -> String {
    body.chars().take(RESPONSE_EXCERPT_CHARS).collect()
}

/// Scans a mailbox and applies `bounced` / `responded` transitions.
pub struct MailboxReconciler {
    db: Arc<dyn Database>,
    connector: Arc<dyn MailboxConnector>,
}

impl MailboxReconciler {
    pub fn new(db: Arc<dyn Database>, connector: Arc<dyn MailboxConnector>) -> Self {
        Self { db, connector }
    }

    /// The credential to scan: the named mailbox, else the warmup mailbox,
    /// else any. It must carry complete IMAP settings.
    async fn mailbox_credential(
        &self,
        mailbox_email: Option<&str>,
    ) -> Result<Credential, ReconcileError> {
        let requested = mailbox_email.map(str::trim).filter(|e| !e.is_empty());
        let credential = match requested {
            Some(email) => self.db.credential_by_email(email).await?.ok_or_else(|| {
                ReconcileError::IncompleteCredential {
                    email: email.to_string(),
                }
            })?,
            None => self
                .db
                .select_credential(CredentialKind::Warmup)
                .await?
                .ok_or(ReconcileError::NoCredential)?,
        };

        match &credential.imap {
            Some(imap) if !imap.host.is_empty() && !imap.user.is_empty() => Ok(credential),
            _ => Err(ReconcileError::IncompleteCredential {
                email: credential.email,
            }),
        }
    }

    /// Run both passes against one mailbox.
    ///
    /// Only a missing credential or a failed connection is an error; failures
    /// inside a pass are collected in the report.
    pub async fn reconcile(
        &self,
        mailbox_email: Option<&str>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let credential = self.mailbox_credential(mailbox_email).await?;
        let mut candidates = self.db.find_respondable_candidates().await?;

        let mut session = self.connector.connect(&credential).await?;
        info!(
            mailbox = %credential.email,
            candidates = candidates.len(),
            "Reconciling mailbox"
        );

        let mut report = ReconcileReport {
            message: "Check complete".into(),
            mailbox: credential.email.clone(),
            ..Default::default()
        };

        match self
            .bounce_pass(session.as_mut(), &candidates, &mut report)
            .await
        {
            Ok(bounced) => candidates.retain(|c| !bounced.contains(&c.id)),
            Err(e) => {
                error!(mailbox = %credential.email, error = %e, "Bounce check failed");
                report.errors.push(format!("bounce check: {e}"));
            }
        }

        for candidate in &candidates {
            if let Err(e) = self
                .reply_pass(session.as_mut(), candidate, &mut report)
                .await
            {
                warn!(recipient_id = candidate.id, email = %candidate.email, error = %e, "Reply check failed");
                report.errors.push(format!("{}: {e}", candidate.email));
            }
        }

        if let Err(e) = session.close().await {
            warn!(mailbox = %credential.email, error = %e, "Failed to close mailbox session");
        }

        info!(
            mailbox = %credential.email,
            responses = report.responses_found,
            bounces = report.bounces_found,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Returns the ids of recipients marked bounced.
    async fn bounce_pass(
        &self,
        session: &mut dyn MailboxSession,
        candidates: &[Recipient],
        report: &mut ReconcileReport,
    ) -> Result<Vec<i64>, ReconcileError> {
        let messages = session
            .search_unseen(&SearchCriteria::BounceNotifications)
            .await?;
        debug!(count = messages.len(), "Bounce notifications found");

        let mut bounced = Vec::new();
        for message in &messages {
            let Some(address) = bounced_address(&message.body) else {
                continue;
            };
            let Some(recipient) = candidates
                .iter()
                .find(|c| normalize_email(&c.email) == address && !bounced.contains(&c.id))
            else {
                continue;
            };

            let reason = match message.subject.as_deref().map(str::trim) {
                Some(subject) if !subject.is_empty() => format!("{BOUNCE_REASON}: {subject}"),
                _ => BOUNCE_REASON.to_string(),
            };
            let transition = Transition::Bounced {
                reason,
                at: Utc::now(),
            };
            if self.db.apply_transition(recipient.id, &transition).await? {
                info!(recipient_id = recipient.id, email = %recipient.email, "Bounce detected");
                bounced.push(recipient.id);
                report.bounces_found += 1;
                report.details.push(ReconcileDetail {
                    outcome: Outcome::Bounce,
                    email: recipient.email.clone(),
                });
            }
        }

        mark_seen(session, &messages).await?;
        Ok(bounced)
    }

    async fn reply_pass(
        &self,
        session: &mut dyn MailboxSession,
        candidate: &Recipient,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let Some(first_id) = candidate.first_email_message_id.as_deref() else {
            return Ok(());
        };
        let messages = session
            .search_unseen(&SearchCriteria::From(candidate.email.clone()))
            .await?;

        // FROM search matches substrings; mail from a lookalike address is
        // left unseen for its own candidate.
        let own: Vec<FetchedMessage> = messages
            .into_iter()
            .filter(|m| {
                m.from
                    .as_deref()
                    .is_none_or(|from| normalize_email(from) == normalize_email(&candidate.email))
            })
            .collect();
        let reply = own.iter().find(|m| is_threaded_reply(m, first_id));

        if let Some(reply) = reply {
            let transition = Transition::Responded {
                body: excerpt(&reply.body),
                at: Utc::now(),
            };
            if self.db.apply_transition(candidate.id, &transition).await? {
                info!(recipient_id = candidate.id, email = %candidate.email, "Reply detected");
                report.responses_found += 1;
                report.details.push(ReconcileDetail {
                    outcome: Outcome::Response,
                    email: candidate.email.clone(),
                });
            }
        } else if !own.is_empty() {
            debug!(
                recipient_id = candidate.id,
                count = own.len(),
                "Mail from recipient is not threaded onto the first email"
            );
        }

        mark_seen(session, &own).await?;
        Ok(())
    }
}

async fn mark_seen(
    session: &mut dyn MailboxSession,
    messages: &[FetchedMessage],
) -> Result<(), MailboxError> {
    if messages.is_empty() {
        return Ok(());
    }
    let uids: Vec<u32> = messages.iter().map(|m| m.uid).collect();
    session.mark_seen(&uids).await
}
