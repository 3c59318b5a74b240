//! In-memory collaborators for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::model::{
    Credential, CredentialKind, ImapSettings, NewCredential, NewTemplate, SmtpSettings, Template,
    TemplateStage,
};
use crate::error::{MailboxError, TransportError};
use crate::mail::{
    FetchedMessage, MailTransport, MailboxConnector, MailboxSession, OutboundMessage,
    SearchCriteria, SentMessage,
};
use crate::store::{Database, LibSqlBackend};

pub(crate) async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

pub(crate) fn new_credential(email: &str, kind: CredentialKind) -> NewCredential {
    NewCredential {
        email: email.into(),
        kind,
        smtp: SmtpSettings {
            host: "smtp.acme.io".into(),
            port: 587,
            user: email.into(),
            password: "pw".into(),
        },
        imap: None,
        tls: true,
        auth_timeout: Duration::from_secs(10),
    }
}

pub(crate) async fn seed_credential(
    db: &Arc<dyn Database>,
    email: &str,
    kind: CredentialKind,
) -> Credential {
    db.upsert_credential(None, &new_credential(email, kind))
        .await
        .unwrap()
}

pub(crate) async fn seed_mailbox_credential(
    db: &Arc<dyn Database>,
    email: &str,
    kind: CredentialKind,
) -> Credential {
    let mut new = new_credential(email, kind);
    new.imap = Some(ImapSettings {
        host: "imap.acme.io".into(),
        port: 993,
        user: email.into(),
        password: "pw".into(),
    });
    db.upsert_credential(None, &new).await.unwrap()
}

pub(crate) async fn seed_template(
    db: &Arc<dyn Database>,
    stage: TemplateStage,
    body: &str,
) -> Template {
    db.upsert_template(
        None,
        &NewTemplate {
            name: stage.as_str().into(),
            active: true,
            subject: "Hello {{firstName}}".into(),
            body: body.into(),
            sender_name: Some("Bo".into()),
            sender_company: Some("Acme".into()),
        },
    )
    .await
    .unwrap()
}

/// Records every message; fails the first `failures` attempts.
#[derive(Default)]
pub(crate) struct StubTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    attempts: AtomicU32,
    failures: u32,
}

impl StubTransport {
    pub(crate) fn failing(failures: u32) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for StubTransport {
    async fn send(
        &self,
        credential: &Credential,
        message: &OutboundMessage,
    ) -> Result<SentMessage, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(TransportError::SendFailed {
                host: credential.smtp.host.clone(),
                reason: format!("attempt {attempt} refused"),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(SentMessage {
            message_id: message.message_id.clone(),
        })
    }
}

#[derive(Default)]
struct MailboxState {
    messages: Vec<(FetchedMessage, bool)>,
    next_uid: u32,
    fail_connect: bool,
    fail_bounce_search: bool,
    fail_from: Vec<String>,
}

/// Shared in-memory mailbox honouring the `\Seen` flag.
#[derive(Clone, Default)]
pub(crate) struct StubMailbox {
    state: Arc<Mutex<MailboxState>>,
    closed: Arc<AtomicBool>,
}

impl StubMailbox {
    pub(crate) fn deliver(&self, mut message: FetchedMessage) {
        let mut state = self.state.lock().unwrap();
        state.next_uid += 1;
        message.uid = state.next_uid;
        state.messages.push((message, false));
    }

    pub(crate) fn unseen_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.messages.iter().filter(|(_, seen)| !seen).count()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_connect(&self) {
        self.state.lock().unwrap().fail_connect = true;
    }

    pub(crate) fn fail_bounce_search(&self) {
        self.state.lock().unwrap().fail_bounce_search = true;
    }

    pub(crate) fn fail_search_from(&self, address: &str) {
        self.state.lock().unwrap().fail_from.push(address.to_lowercase());
    }
}

#[async_trait]
impl MailboxConnector for StubMailbox {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn MailboxSession>, MailboxError> {
        if self.state.lock().unwrap().fail_connect {
            return Err(MailboxError::ConnectFailed {
                host: "imap.acme.io".into(),
                port: 993,
                reason: format!("refused for {}", credential.email),
            });
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

fn matches(criteria: &SearchCriteria, message: &FetchedMessage) -> bool {
    let from = message.from.as_deref().unwrap_or_default().to_lowercase();
    match criteria {
        SearchCriteria::BounceNotifications => {
            from.contains("mailer-daemon") || from.contains("mail delivery")
        }
        SearchCriteria::From(address) => from.contains(&address.to_lowercase()),
    }
}

#[async_trait]
impl MailboxSession for StubMailbox {
    async fn search_unseen(
        &mut self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<FetchedMessage>, MailboxError> {
        let state = self.state.lock().unwrap();
        let refused = match criteria {
            SearchCriteria::BounceNotifications => state.fail_bounce_search,
            SearchCriteria::From(address) => state.fail_from.contains(&address.to_lowercase()),
        };
        if refused {
            return Err(MailboxError::Command {
                command: "UID SEARCH".into(),
                reason: "stub refused".into(),
            });
        }
        Ok(state
            .messages
            .iter()
            .filter(|(m, seen)| !seen && matches(criteria, m))
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError> {
        let mut state = self.state.lock().unwrap();
        for (message, seen) in state.messages.iter_mut() {
            if uids.contains(&message.uid) {
                *seen = true;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MailboxError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
