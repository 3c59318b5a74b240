//! Mail collaborators: outbound SMTP and mailbox (IMAP) scanning.
//!
//! The dispatch engine and reconciler only see the traits here, so tests
//! substitute in-memory stubs for the network.

pub mod imap;
pub mod parse;
pub mod smtp;

use async_trait::async_trait;

use crate::error::{MailboxError, TransportError};
use crate::outreach::model::Credential;

pub use imap::ImapConnector;
pub use smtp::SmtpMailer;

/// Value of the `X-Campaign` header, identifying the sequence stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Campaign {
    FirstEmail,
    SecondEmail,
}

impl Campaign {
    pub fn as_str(&self) -> &'static str {
        match self {
            Campaign::FirstEmail => "first-email",
            Campaign::SecondEmail => "second-email",
        }
    }
}

/// A fully rendered message ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from_name: String,
    pub from_email: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    /// Assigned by the caller so the ledger can record it before the
    /// transport reports back.
    pub message_id: String,
    /// Threading target; sets both `In-Reply-To` and `References`.
    pub in_reply_to: Option<String>,
    pub campaign: Campaign,
    pub recipient_id: i64,
}

/// Transport acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
}

/// Outbound mail transport.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        credential: &Credential,
        message: &OutboundMessage,
    ) -> Result<SentMessage, TransportError>;
}

/// Unseen-message search filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    /// Unseen mail from delivery-status notifiers (`mailer-daemon`,
    /// `Mail Delivery`).
    BounceNotifications,
    /// Unseen mail whose `From` header matches the address.
    From(String),
}

/// A message pulled out of a mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    pub uid: u32,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub body: String,
}

/// Opens mailbox sessions for a credential.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, credential: &Credential)
    -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// One authenticated, INBOX-selected mailbox session.
#[async_trait]
pub trait MailboxSession: Send {
    async fn search_unseen(
        &mut self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<FetchedMessage>, MailboxError>;

    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError>;

    async fn close(&mut self) -> Result<(), MailboxError>;
}
