//! Minimal blocking IMAP client over rustls, driven from async code through
//! `spawn_blocking`.
//!
//! Only what the reconciler needs: LOGIN, SELECT, UID SEARCH, UID FETCH,
//! UID STORE and LOGOUT. Literals (`{n}\r\n` followed by n bytes) are read
//! exactly, so message bodies survive intact.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use tracing::{debug, info, warn};

use super::parse::parse_message;
use super::{FetchedMessage, MailboxConnector, MailboxSession, SearchCriteria};
use crate::error::MailboxError;
use crate::outreach::model::{Credential, ImapSettings};

/// Port on which IMAP speaks TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 993;

// ── Transport stream ────────────────────────────────────────────────

/// TCP connection, TLS-wrapped or plain.
pub enum ImapStream {
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    Plain(TcpStream),
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ImapStream::Tls(s) => s.read(buf),
            ImapStream::Plain(s) => s.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ImapStream::Tls(s) => s.write(buf),
            ImapStream::Plain(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ImapStream::Tls(s) => s.flush(),
            ImapStream::Plain(s) => s.flush(),
        }
    }
}

/// Open a TCP (and, if requested, TLS) connection with the given timeout.
fn open_stream(
    settings: &ImapSettings,
    use_tls: bool,
    timeout: Duration,
) -> Result<ImapStream, MailboxError> {
    let connect_failed = |reason: String| MailboxError::ConnectFailed {
        host: settings.host.clone(),
        port: settings.port,
        reason,
    };

    let addr = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| connect_failed(e.to_string()))?
        .next()
        .ok_or_else(|| connect_failed("host did not resolve".into()))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| connect_failed(e.to_string()))?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    if !use_tls {
        return Ok(ImapStream::Plain(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name =
        ServerName::try_from(settings.host.clone()).map_err(|e| connect_failed(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| connect_failed(e.to_string()))?;

    Ok(ImapStream::Tls(Box::new(rustls::StreamOwned::new(conn, tcp))))
}

// ── Protocol client ─────────────────────────────────────────────────

/// One untagged response line, with the literal it announced (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub text: String,
    pub literal: Option<Vec<u8>>,
}

/// Blocking IMAP command runner over any byte stream.
pub struct ImapClient<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
    timeout: Duration,
}

impl<S: Read + Write> ImapClient<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
            timeout,
        }
    }

    fn io_error(&self, e: std::io::Error) -> MailboxError {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => MailboxError::Timeout(self.timeout),
            _ => MailboxError::Io(e),
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let n = self
            .stream
            .read_until(b'\n', &mut buf)
            .map_err(|e| self.io_error(e))?;
        if n == 0 {
            return Err(MailboxError::Closed);
        }
        Ok(buf)
    }

    /// Read and check the server greeting.
    pub fn greeting(&mut self) -> Result<(), MailboxError> {
        let line = String::from_utf8_lossy(&self.read_line()?).into_owned();
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Command {
                command: "GREETING".into(),
                reason: line.trim().to_string(),
            })
        }
    }

    /// Send one tagged command and collect its untagged responses until the
    /// tagged completion. Anything but `OK` is an error.
    pub fn run(&mut self, command: &str) -> Result<Vec<ResponseLine>, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let verb = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        debug!(tag = %tag, command = %verb, "IMAP command");

        let written = {
            let stream = self.stream.get_mut();
            stream
                .write_all(format!("{tag} {command}\r\n").as_bytes())
                .and_then(|_| stream.flush())
        };
        written.map_err(|e| self.io_error(e))?;

        let tag_prefix = format!("{tag} ");
        let mut responses = Vec::new();
        loop {
            let raw = self.read_line()?;
            let line = String::from_utf8_lossy(&raw).into_owned();

            if let Some(status) = line.strip_prefix(&tag_prefix) {
                let status = status.trim();
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                return Err(MailboxError::Command {
                    command: verb,
                    reason: status.to_string(),
                });
            }

            match literal_length(&line) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream
                        .read_exact(&mut literal)
                        .map_err(|e| self.io_error(e))?;
                    // The response continues on the line after the literal
                    let rest = String::from_utf8_lossy(&self.read_line()?).into_owned();
                    responses.push(ResponseLine {
                        text: format!("{}{}", line.trim_end(), rest.trim_end()),
                        literal: Some(literal),
                    });
                }
                None => responses.push(ResponseLine {
                    text: line.trim_end().to_string(),
                    literal: None,
                }),
            }
        }
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        self.run(&format!("LOGIN {} {}", quote(user), quote(password)))
            .map(|_| ())
            .map_err(|e| match e {
                MailboxError::Command { .. } => MailboxError::AuthFailed {
                    user: user.to_string(),
                },
                other => other,
            })
    }

    pub fn select_inbox(&mut self) -> Result<(), MailboxError> {
        self.run("SELECT INBOX").map(|_| ())
    }

    pub fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, MailboxError> {
        let responses = self.run(&format!("UID SEARCH {}", search_query(criteria)))?;
        Ok(parse_search(&responses))
    }

    /// Fetch the full message without setting `\Seen`.
    pub fn uid_fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailboxError> {
        let responses = self.run(&format!("UID FETCH {uid} (UID BODY.PEEK[])"))?;
        Ok(responses.into_iter().find_map(|r| r.literal))
    }

    pub fn uid_store_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.run(&format!("UID STORE {set} +FLAGS (\\Seen)")).map(|_| ())
    }

    pub fn logout(&mut self) -> Result<(), MailboxError> {
        match self.run("LOGOUT") {
            Ok(_) | Err(MailboxError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Search keys for a criteria value. Always restricted to unseen mail.
pub fn search_query(criteria: &SearchCriteria) -> String {
    match criteria {
        SearchCriteria::BounceNotifications => {
            "UNSEEN OR FROM \"mailer-daemon\" FROM \"Mail Delivery\"".to_string()
        }
        SearchCriteria::From(address) => format!("UNSEEN FROM {}", quote(address)),
    }
}

/// Length announced by a trailing `{n}` literal marker.
fn literal_length(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` responses.
fn parse_search(responses: &[ResponseLine]) -> Vec<u32> {
    responses
        .iter()
        .filter_map(|r| r.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

// ── Async session ───────────────────────────────────────────────────

/// Connects to a credential's IMAP server.
#[derive(Debug, Clone, Default)]
pub struct ImapConnector;

impl ImapConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let settings = credential
            .imap
            .clone()
            .ok_or_else(|| MailboxError::ConnectFailed {
                host: String::new(),
                port: 0,
                reason: format!("no IMAP settings for {}", credential.email),
            })?;
        let use_tls = credential.tls || settings.port == IMPLICIT_TLS_PORT;
        let timeout = credential.auth_timeout;
        let host = settings.host.clone();

        let client = tokio::task::spawn_blocking(move || {
            let stream = open_stream(&settings, use_tls, timeout)?;
            let mut client = ImapClient::new(stream, timeout);
            client.greeting()?;
            client.login(&settings.user, &settings.password)?;
            client.select_inbox()?;
            Ok::<_, MailboxError>(client)
        })
        .await
        .map_err(|e| MailboxError::ConnectFailed {
            host: host.clone(),
            port: 0,
            reason: format!("connect task failed: {e}"),
        })??;

        info!(host = %host, mailbox = %credential.email, "IMAP session opened");
        Ok(Box::new(ImapSession {
            client: Some(client),
        }))
    }
}

/// Live session; the client moves into a blocking task for every call.
pub struct ImapSession<S: Read + Write + Send + 'static = ImapStream> {
    client: Option<ImapClient<S>>,
}

impl<S: Read + Write + Send + 'static> ImapSession<S> {
    async fn with_client<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapClient<S>) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut client = self.client.take().ok_or(MailboxError::Closed)?;
        let (client, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut client);
            (client, result)
        })
        .await
        .map_err(|e| MailboxError::Command {
            command: "TASK".into(),
            reason: e.to_string(),
        })?;
        self.client = Some(client);
        result
    }
}

#[async_trait]
impl<S: Read + Write + Send + 'static> MailboxSession for ImapSession<S> {
    async fn search_unseen(
        &mut self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<FetchedMessage>, MailboxError> {
        let criteria = criteria.clone();
        self.with_client(move |client| {
            let uids = client.uid_search(&criteria)?;
            let mut messages = Vec::with_capacity(uids.len());
            for uid in uids {
                match client.uid_fetch(uid)? {
                    Some(raw) => messages.push(parse_message(uid, &raw)),
                    None => warn!(uid, "FETCH returned no body"),
                }
            }
            Ok(messages)
        })
        .await
    }

    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError> {
        let uids = uids.to_vec();
        self.with_client(move |client| client.uid_store_seen(&uids))
            .await
    }

    async fn close(&mut self) -> Result<(), MailboxError> {
        if self.client.is_none() {
            return Ok(());
        }
        let result = self.with_client(|client| client.logout()).await;
        self.client = None;
        result
    }
}
