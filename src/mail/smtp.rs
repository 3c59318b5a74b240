//! SMTP transport via lettre.
//!
//! lettre's blocking `SmtpTransport` runs inside `spawn_blocking`; a fresh
//! transport is built per send from the credential.

use async_trait::async_trait;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use tracing::{debug, info};

use super::{MailTransport, OutboundMessage, SentMessage};
use crate::error::TransportError;
use crate::outreach::model::Credential;

/// Port on which SMTP speaks TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

/// `X-Campaign` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct XCampaign(String);

impl Header for XCampaign {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Campaign")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.trim().to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// `X-Recipient-ID` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct XRecipientId(i64);

impl Header for XRecipientId {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Recipient-ID")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.trim().parse()?))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.to_string())
    }
}

/// Sends through the credential's SMTP server.
#[derive(Debug, Clone, Default)]
pub struct SmtpMailer;

impl SmtpMailer {
    pub fn new() -> Self {
        Self
    }
}

fn parse_address(address: &str) -> Result<Address, TransportError> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|e| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Build the MIME message for an outbound send.
pub fn build_message(message: &OutboundMessage) -> Result<Message, TransportError> {
    let from = Mailbox::new(
        Some(message.from_name.clone()),
        parse_address(&message.from_email)?,
    );
    let to = Mailbox::new(None, parse_address(&message.to)?);

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone())
        .message_id(Some(message.message_id.clone()))
        .header(XCampaign(message.campaign.as_str().to_string()))
        .header(XRecipientId(message.recipient_id))
        .header(ContentType::TEXT_PLAIN);

    if let Some(parent) = &message.in_reply_to {
        builder = builder.in_reply_to(parent.clone()).references(parent.clone());
    }

    builder
        .body(message.text.clone())
        .map_err(|e| TransportError::Build(e.to_string()))
}

/// Build a transport for the credential: implicit TLS on 465, STARTTLS when
/// `tls` is set, plain otherwise.
fn build_transport(credential: &Credential) -> Result<SmtpTransport, TransportError> {
    let host = credential.smtp.host.as_str();
    let send_failed = |e: lettre::transport::smtp::Error| TransportError::SendFailed {
        host: host.to_string(),
        reason: format!("SMTP relay error: {e}"),
    };

    let builder = if credential.smtp.port == IMPLICIT_TLS_PORT {
        SmtpTransport::relay(host).map_err(send_failed)?
    } else if credential.tls {
        SmtpTransport::starttls_relay(host).map_err(send_failed)?
    } else {
        SmtpTransport::builder_dangerous(host)
    };

    Ok(builder
        .port(credential.smtp.port)
        .credentials(Credentials::new(
            credential.smtp.user.clone(),
            credential.smtp.password.clone(),
        ))
        .timeout(Some(credential.auth_timeout))
        .build())
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        credential: &Credential,
        message: &OutboundMessage,
    ) -> Result<SentMessage, TransportError> {
        let email = build_message(message)?;
        let transport = build_transport(credential)?;
        let host = credential.smtp.host.clone();

        debug!(to = %message.to, host = %host, "Sending via SMTP");
        let result = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| TransportError::Task(e.to_string()))?;

        result.map_err(|e| TransportError::SendFailed {
            host,
            reason: e.to_string(),
        })?;

        info!(to = %message.to, message_id = %message.message_id, "Email sent");
        Ok(SentMessage {
            message_id: message.message_id.clone(),
        })
    }
}
