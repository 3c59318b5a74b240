//! Ledger types: recipients, templates, credentials and the state transitions
//! between recipient statuses.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a recipient in the outreach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    /// Imported, nothing sent yet.
    Pending,
    /// First-touch message delivered to the transport.
    FirstSent,
    /// Follow-up delivered; the sequence is complete.
    SecondSent,
    /// A threaded reply was detected.
    Responded,
    /// A non-delivery notification was detected. Absorbing.
    Bounced,
}

impl RecipientStatus {
    pub const ALL: [RecipientStatus; 5] = [
        RecipientStatus::Pending,
        RecipientStatus::FirstSent,
        RecipientStatus::SecondSent,
        RecipientStatus::Responded,
        RecipientStatus::Bounced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::FirstSent => "first_sent",
            RecipientStatus::SecondSent => "second_sent",
            RecipientStatus::Responded => "responded",
            RecipientStatus::Bounced => "bounced",
        }
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "first_sent" => Ok(RecipientStatus::FirstSent),
            "second_sent" => Ok(RecipientStatus::SecondSent),
            "responded" => Ok(RecipientStatus::Responded),
            "bounced" => Ok(RecipientStatus::Bounced),
            other => Err(format!("unknown recipient status: {other}")),
        }
    }
}

/// A prospect tracked through the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub status: RecipientStatus,
    pub first_email_sent_at: Option<DateTime<Utc>>,
    pub first_email_message_id: Option<String>,
    pub second_email_sent_at: Option<DateTime<Utc>>,
    pub second_email_message_id: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_body: Option<String>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub bounce_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when a recipient enters the ledger.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRecipient {
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
}

impl NewRecipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    /// Trim every field, lower-case the email and drop empty optionals.
    pub fn normalized(&self) -> Self {
        fn clean(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }
        Self {
            email: normalize_email(&self.email),
            name: clean(&self.name),
            company: clean(&self.company),
        }
    }
}

/// Canonical form used for storage and every address comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A single-row ledger update. Each variant sets one timestamp and its
/// companion value, plus the resulting status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    FirstSent {
        message_id: String,
        at: DateTime<Utc>,
    },
    SecondSent {
        message_id: String,
        at: DateTime<Utc>,
    },
    Responded {
        body: String,
        at: DateTime<Utc>,
    },
    Bounced {
        reason: String,
        at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn target_status(&self) -> RecipientStatus {
        match self {
            Transition::FirstSent { .. } => RecipientStatus::FirstSent,
            Transition::SecondSent { .. } => RecipientStatus::SecondSent,
            Transition::Responded { .. } => RecipientStatus::Responded,
            Transition::Bounced { .. } => RecipientStatus::Bounced,
        }
    }
}

/// Named sequence stages that templates are attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateStage {
    #[serde(rename = "firstEmail")]
    FirstEmail,
    #[serde(rename = "secondEmailNonResponders")]
    SecondEmailNonResponders,
    #[serde(rename = "secondEmailResponders")]
    SecondEmailResponders,
}

impl TemplateStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStage::FirstEmail => "firstEmail",
            TemplateStage::SecondEmailNonResponders => "secondEmailNonResponders",
            TemplateStage::SecondEmailResponders => "secondEmailResponders",
        }
    }

    /// Follow-up template for a recipient, chosen by whether they replied.
    pub fn follow_up_for(status: RecipientStatus) -> Self {
        if status == RecipientStatus::Responded {
            TemplateStage::SecondEmailResponders
        } else {
            TemplateStage::SecondEmailNonResponders
        }
    }
}

impl fmt::Display for TemplateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message template for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub subject: String,
    pub body: String,
    pub sender_name: Option<String>,
    pub sender_company: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Operator-supplied template fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTemplate {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_company: Option<String>,
}

/// Which sequence stage a credential sends for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// First touch, and the mailbox scanned for replies and bounces.
    Warmup,
    /// Follow-up sends.
    Final,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Warmup => "warmup",
            CredentialKind::Final => "final",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warmup" => Ok(CredentialKind::Warmup),
            "final" => Ok(CredentialKind::Final),
            other => Err(format!("unknown credential type: {other}")),
        }
    }
}

/// SMTP (sending) side of a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

/// IMAP (receiving) side of a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

fn default_imap_port() -> u16 {
    993
}

/// Default connect/auth timeout for a credential's mail servers.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(10_000);

/// A mailbox account used to send and (optionally) receive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: i64,
    pub email: String,
    #[serde(rename = "type")]
    pub kind: CredentialKind,
    pub smtp: SmtpSettings,
    pub imap: Option<ImapSettings>,
    pub tls: bool,
    #[serde(with = "duration_ms")]
    pub auth_timeout: Duration,
}

impl Credential {
    /// Domain part of the account address, used for generated Message-IDs.
    pub fn domain(&self) -> &str {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("localhost")
    }
}

/// Operator-supplied credential fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCredential {
    pub email: String,
    #[serde(rename = "type")]
    pub kind: CredentialKind,
    pub smtp: SmtpSettings,
    #[serde(default)]
    pub imap: Option<ImapSettings>,
    #[serde(default = "default_tls")]
    pub tls: bool,
    #[serde(default = "default_auth_timeout", with = "duration_ms")]
    pub auth_timeout: Duration,
}

fn default_tls() -> bool {
    true
}

fn default_auth_timeout() -> Duration {
    DEFAULT_AUTH_TIMEOUT
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Recipient count per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: u64,
    pub first_sent: u64,
    pub second_sent: u64,
    pub responded: u64,
    pub bounced: u64,
    pub total: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: RecipientStatus, count: u64) {
        match status {
            RecipientStatus::Pending => self.pending += count,
            RecipientStatus::FirstSent => self.first_sent += count,
            RecipientStatus::SecondSent => self.second_sent += count,
            RecipientStatus::Responded => self.responded += count,
            RecipientStatus::Bounced => self.bounced += count,
        }
        self.total += count;
    }
}
