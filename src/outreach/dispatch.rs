//! Dispatch engine: first-touch and follow-up sends.
//!
//! Each invocation moves at most one recipient forward. Selection is followed
//! by a conditional claim so that overlapping invocations cannot both send to
//! the same recipient; the claim is released if the send fails and cleared by
//! the transition write when it succeeds.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::model::{Credential, CredentialKind, Recipient, TemplateStage, Transition};
use super::retry::{RetryPolicy, retry};
use super::template::render_for;
use crate::error::{DispatchError, TransportError};
use crate::mail::{Campaign, MailTransport, OutboundMessage, SentMessage};
use crate::store::Database;

/// Default follow-up wait, in days.
pub const DEFAULT_WAIT_DAYS: f64 = 2.0;

/// Latest first-send time that is due for a follow-up after `wait_days`.
///
/// A wait reaching past the representable range clamps to the Unix epoch, so
/// nothing is due.
fn follow_up_threshold(now: DateTime<Utc>, wait_days: f64) -> DateTime<Utc> {
    let seconds = (wait_days * 86_400.0).round();
    let seconds = if seconds >= i64::MAX as f64 { i64::MAX } else { seconds as i64 };
    chrono::Duration::try_seconds(seconds)
        .and_then(|wait| now.checked_sub_signed(wait))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |threshold| {
            threshold.max(DateTime::<Utc>::UNIX_EPOCH)
        })
}

/// Result of a first-send invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstSendReport {
    pub message: String,
    pub sent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// False when the email went out but the recipient had moved on, so the
    /// ledger kept its state.
    pub recorded: bool,
}

impl FirstSendReport {
    fn nothing(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sent: 0,
            email: None,
            message_id: None,
            recorded: false,
        }
    }
}

/// Follow-up knobs accepted per call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpOptions {
    #[serde(default)]
    pub wait_days: Option<f64>,
    #[serde(default)]
    pub skip_wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailStatus {
    Sent,
    Failed,
}

/// Per-recipient outcome of a follow-up invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpDetail {
    pub email: String,
    pub status: DetailStatus,
    pub template: TemplateStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded: bool,
}

/// Result of a follow-up invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpReport {
    pub message: String,
    pub sent: u32,
    pub failed: u32,
    pub details: Vec<FollowUpDetail>,
}

impl FollowUpReport {
    fn nothing(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sent: 0,
            failed: 0,
            details: Vec::new(),
        }
    }

    fn failed(detail: FollowUpDetail) -> Self {
        Self {
            message: "Follow-up failed".into(),
            sent: 0,
            failed: 1,
            details: vec![detail],
        }
    }
}

/// Sends sequence emails through a [`MailTransport`] and records the outcome.
pub struct DispatchEngine {
    db: Arc<dyn Database>,
    transport: Arc<dyn MailTransport>,
    retry: RetryPolicy,
    claim_lease: Duration,
    default_wait_days: f64,
}

impl DispatchEngine {
    pub fn new(db: Arc<dyn Database>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            db,
            transport,
            retry: RetryPolicy::default(),
            claim_lease: Duration::from_secs(300),
            default_wait_days: DEFAULT_WAIT_DAYS,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_default_wait_days(mut self, days: f64) -> Self {
        self.default_wait_days = days;
        self
    }

    async fn credential(&self, kind: CredentialKind) -> Result<Credential, DispatchError> {
        self.db
            .select_credential(kind)
            .await?
            .ok_or_else(|| DispatchError::NoCredential {
                kind: kind.to_string(),
            })
    }

    async fn send_with_retry(
        &self,
        credential: &Credential,
        message: &OutboundMessage,
    ) -> Result<SentMessage, TransportError> {
        let transport = &self.transport;
        retry(&self.retry, move || transport.send(credential, message)).await
    }

    fn claim_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    /// Write the post-send transition. Returns false when the recipient moved
    /// on while the message was in flight.
    ///
    /// A failed write keeps the claim until its lease expires.
    async fn record(
        &self,
        recipient: &Recipient,
        transition: &Transition,
        sent: &SentMessage,
    ) -> Result<bool, DispatchError> {
        match self.db.apply_transition(recipient.id, transition).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(
                    recipient_id = recipient.id,
                    message_id = %sent.message_id,
                    "Recipient changed state during send; ledger not updated"
                );
                self.db.release_claim(recipient.id).await?;
                Ok(false)
            }
            Err(e) => {
                error!(
                    recipient_id = recipient.id,
                    email = %recipient.email,
                    message_id = %sent.message_id,
                    error = %e,
                    "Email sent but ledger write failed"
                );
                Err(e.into())
            }
        }
    }

    fn outbound(
        credential: &Credential,
        recipient: &Recipient,
        subject: String,
        text: String,
        sender_name: String,
        campaign: Campaign,
        in_reply_to: Option<String>,
    ) -> OutboundMessage {
        OutboundMessage {
            from_name: sender_name,
            from_email: credential.email.clone(),
            to: recipient.email.clone(),
            subject,
            text,
            message_id: format!("<{}@{}>", Uuid::new_v4(), credential.domain()),
            in_reply_to,
            campaign,
            recipient_id: recipient.id,
        }
    }

    /// Send the first-touch email to the oldest pending recipient.
    ///
    /// Configuration problems and a final transport failure are errors; no
    /// eligible recipient is a successful zero-sent report.
    pub async fn first_send(&self) -> Result<FirstSendReport, DispatchError> {
        let credential = self.credential(CredentialKind::Warmup).await?;
        let stage = TemplateStage::FirstEmail;
        let template = self
            .db
            .active_template(stage.as_str())
            .await?
            .ok_or_else(|| DispatchError::NoActiveTemplate {
                name: stage.as_str().to_string(),
            })?;

        let now = Utc::now();
        let Some(recipient) = self.db.find_eligible_for_first_send(now).await? else {
            return Ok(FirstSendReport::nothing("No pending recipients found"));
        };

        if !self
            .db
            .claim_recipient(recipient.id, recipient.status, self.claim_until(now), now)
            .await?
        {
            info!(recipient_id = recipient.id, "Recipient claimed by another run");
            return Ok(FirstSendReport::nothing("Recipient claimed by another run"));
        }

        let rendered = render_for(&template, &recipient);
        let message = Self::outbound(
            &credential,
            &recipient,
            rendered.subject,
            rendered.body,
            rendered.sender_name,
            Campaign::FirstEmail,
            None,
        );

        let sent = match self.send_with_retry(&credential, &message).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(recipient_id = recipient.id, email = %recipient.email, error = %e, "First send failed");
                self.db.release_claim(recipient.id).await?;
                return Err(DispatchError::Send {
                    email: recipient.email,
                    source: e,
                });
            }
        };

        let transition = Transition::FirstSent {
            message_id: sent.message_id.clone(),
            at: Utc::now(),
        };
        let recorded = self.record(&recipient, &transition, &sent).await?;

        info!(recipient_id = recipient.id, email = %recipient.email, recorded, "First email sent");
        Ok(FirstSendReport {
            message: if recorded {
                "Email sent successfully".into()
            } else {
                "Email sent but recipient changed state during send".into()
            },
            sent: 1,
            email: Some(recipient.email),
            message_id: Some(sent.message_id),
            recorded,
        })
    }

    /// Send the follow-up to the recipient whose first email is oldest.
    ///
    /// The template depends on whether the recipient replied. A missing
    /// template or failed send is reported per recipient, not as an error.
    pub async fn follow_up(&self, options: &FollowUpOptions) -> Result<FollowUpReport, DispatchError> {
        let credential = self.credential(CredentialKind::Final).await?;

        let wait_days = options
            .wait_days
            .filter(|d| d.is_finite() && *d >= 0.0)
            .unwrap_or(self.default_wait_days);
        let now = Utc::now();
        let threshold = follow_up_threshold(now, wait_days);

        let Some(recipient) = self
            .db
            .find_eligible_for_follow_up(threshold, options.skip_wait, now)
            .await?
        else {
            return Ok(FollowUpReport::nothing("No recipients due for a follow-up"));
        };

        let stage = TemplateStage::follow_up_for(recipient.status);
        let Some(template) = self.db.active_template(stage.as_str()).await? else {
            let error = DispatchError::NoActiveTemplate {
                name: stage.as_str().to_string(),
            };
            warn!(recipient_id = recipient.id, error = %error, "Follow-up skipped");
            return Ok(FollowUpReport::failed(FollowUpDetail {
                email: recipient.email,
                status: DetailStatus::Failed,
                template: stage,
                threaded: None,
                error: Some(error.to_string()),
                recorded: false,
            }));
        };

        if !self
            .db
            .claim_recipient(recipient.id, recipient.status, self.claim_until(now), now)
            .await?
        {
            info!(recipient_id = recipient.id, "Recipient claimed by another run");
            return Ok(FollowUpReport::nothing("Recipient claimed by another run"));
        }

        let rendered = render_for(&template, &recipient);
        let threaded = recipient.first_email_message_id.is_some();
        let message = Self::outbound(
            &credential,
            &recipient,
            rendered.subject,
            rendered.body,
            rendered.sender_name,
            Campaign::SecondEmail,
            recipient.first_email_message_id.clone(),
        );

        let sent = match self.send_with_retry(&credential, &message).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(recipient_id = recipient.id, email = %recipient.email, error = %e, "Follow-up send failed");
                self.db.release_claim(recipient.id).await?;
                return Ok(FollowUpReport::failed(FollowUpDetail {
                    email: recipient.email,
                    status: DetailStatus::Failed,
                    template: stage,
                    threaded: Some(threaded),
                    error: Some(e.to_string()),
                    recorded: false,
                }));
            }
        };

        let transition = Transition::SecondSent {
            message_id: sent.message_id.clone(),
            at: Utc::now(),
        };
        let recorded = self.record(&recipient, &transition, &sent).await?;

        info!(
            recipient_id = recipient.id,
            email = %recipient.email,
            template = %stage,
            threaded,
            recorded,
            "Follow-up sent"
        );
        Ok(FollowUpReport {
            message: "Follow-up processing complete".into(),
            sent: 1,
            failed: 0,
            details: vec![FollowUpDetail {
                email: recipient.email,
                status: DetailStatus::Sent,
                template: stage,
                threaded: Some(threaded),
                error: (!recorded)
                    .then(|| "recipient changed state during send; ledger not updated".into()),
                recorded,
            }],
        })
    }
}
