//! Integration tests for the outreach HTTP surface.
//!
//! Each test spins up the Axum router on a random port over an in-memory
//! database, with a recording SMTP stub and an in-memory mailbox, and drives
//! it with reqwest.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use outreach_sequencer::api::{AppState, CRON_SECRET_HEADER, outreach_routes};
use outreach_sequencer::error::{MailboxError, TransportError};
use outreach_sequencer::mail::{
    FetchedMessage, MailTransport, MailboxConnector, MailboxSession, OutboundMessage,
    SearchCriteria, SentMessage,
};
use outreach_sequencer::outreach::model::Credential;
use outreach_sequencer::outreach::retry::RetryPolicy;
use outreach_sequencer::outreach::{DispatchEngine, MailboxReconciler};
use outreach_sequencer::store::{Database, LibSqlBackend};

const CRON: &str = "cron-secret";
const SUBMIT: &str = "open-sesame";

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(
        &self,
        _credential: &Credential,
        message: &OutboundMessage,
    ) -> Result<SentMessage, TransportError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(SentMessage {
            message_id: message.message_id.clone(),
        })
    }
}

/// Mailbox holding `(message, seen)` pairs.
#[derive(Clone, Default)]
struct MemoryMailbox {
    messages: Arc<Mutex<Vec<(FetchedMessage, bool)>>>,
}

impl MemoryMailbox {
    fn deliver(&self, mut message: FetchedMessage) {
        let mut messages = self.messages.lock().unwrap();
        message.uid = messages.len() as u32 + 1;
        messages.push((message, false));
    }
}

#[async_trait]
impl MailboxConnector for MemoryMailbox {
    async fn connect(&self, _credential: &Credential) -> Result<Box<dyn MailboxSession>, MailboxError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl MailboxSession for MemoryMailbox {
    async fn search_unseen(
        &mut self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<FetchedMessage>, MailboxError> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|(m, seen)| {
                let from = m.from.clone().unwrap_or_default().to_lowercase();
                !seen
                    && match criteria {
                        SearchCriteria::BounceNotifications => {
                            from.contains("mailer-daemon") || from.contains("mail delivery")
                        }
                        SearchCriteria::From(addr) => from.contains(&addr.to_lowercase()),
                    }
            })
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError> {
        for (m, seen) in self.messages.lock().unwrap().iter_mut() {
            if uids.contains(&m.uid) {
                *seen = true;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MailboxError> {
        Ok(())
    }
}

struct Harness {
    base: String,
    client: reqwest::Client,
    transport: Arc<RecordingTransport>,
    mailbox: MemoryMailbox,
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn cron_post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(CRON_SECRET_HEADER, CRON)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn cron_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header(CRON_SECRET_HEADER, CRON)
            .send()
            .await
            .unwrap()
    }
}

/// Start an Axum server on a random port.
async fn start_server() -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport = Arc::new(RecordingTransport::default());
    let mailbox = MemoryMailbox::default();

    let dispatch = DispatchEngine::new(Arc::clone(&db), transport.clone()).with_retry(RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
    });
    let reconciler = MailboxReconciler::new(Arc::clone(&db), Arc::new(mailbox.clone()));

    let app = outreach_routes(AppState {
        db,
        dispatch: Arc::new(dispatch),
        reconciler: Arc::new(reconciler),
        cron_secret: CRON.to_string().into(),
        submission_secret: SUBMIT.to_string().into(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        transport,
        mailbox,
    }
}

async fn configure(h: &Harness) {
    for (email, kind) in [("warm@acme.io", "warmup"), ("final@acme.io", "final")] {
        let resp = h
            .cron_post(
                "/api/credentials",
                json!({
                    "email": email,
                    "type": kind,
                    "smtp": {"host": "smtp.acme.io", "port": 587, "user": email, "password": "pw"},
                    "imap": {"host": "imap.acme.io", "port": 993, "user": email, "password": "pw"},
                }),
            )
            .await;
        assert_eq!(resp.status(), 200);
    }

    for (name, body) in [
        ("firstEmail", "Hi {{name}}"),
        ("secondEmailNonResponders", "Just following up, {{firstName}}"),
        ("secondEmailResponders", "Thanks for replying"),
    ] {
        let resp = h
            .cron_post(
                "/api/templates",
                json!({"name": name, "active": true, "subject": "Hello", "body": body}),
            )
            .await;
        assert_eq!(resp.status(), 200);
    }
}

async fn submit(h: &Harness, body: Value) -> reqwest::Response {
    h.client
        .post(h.url("/api/submit"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_open() {
    let h = start_server().await;
    let resp = h.client.get(h.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn triggers_require_cron_secret() {
    let h = start_server().await;
    configure(&h).await;
    submit(&h, json!({"email": "ann@x.com", "secret": SUBMIT})).await;

    for path in ["/api/send-warmup", "/api/send-followup", "/api/check-responses"] {
        let resp = h
            .client
            .post(h.url(path))
            .header(CRON_SECRET_HEADER, "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401, "{path}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Unauthorized");
    }

    let resp = h.client.get(h.url("/api/stats")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    // No side effect
    assert!(h.transport.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn submission_validation() {
    let h = start_server().await;

    let resp = submit(&h, json!({"email": "ann@x.com", "secret": "nope"})).await;
    assert_eq!(resp.status(), 401);

    let resp = submit(&h, json!({"email": "  ", "secret": SUBMIT})).await;
    assert_eq!(resp.status(), 400);

    let resp = submit(&h, json!({"email": "not-an-email", "secret": SUBMIT})).await;
    assert_eq!(resp.status(), 400);

    let resp = submit(&h, json!({"name": "Ann", "email": "ann@x.com", "secret": SUBMIT})).await;
    assert_eq!(resp.status(), 201);

    let resp = submit(&h, json!({"email": "ANN@x.com", "secret": SUBMIT})).await;
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn full_sequence_over_http() {
    let h = start_server().await;
    configure(&h).await;
    submit(&h, json!({"name": "Ann Lee", "email": "ann@x.com", "secret": SUBMIT})).await;
    submit(&h, json!({"name": "Bob", "email": "bob@x.com", "secret": SUBMIT})).await;

    // First send: one recipient per call, oldest first
    let resp = h.cron_post("/api/send-warmup", json!({})).await;
    assert_eq!(resp.status(), 200);
    let first: Value = resp.json().await.unwrap();
    assert_eq!(first["sent"], 1);
    assert_eq!(first["email"], "ann@x.com");
    let ann_message_id = first["messageId"].as_str().unwrap().to_string();
    assert_eq!(h.transport.sent.lock().unwrap()[0].text, "Hi Ann Lee");

    let second: Value = h.cron_post("/api/send-warmup", json!({})).await.json().await.unwrap();
    assert_eq!(second["email"], "bob@x.com");

    let third: Value = h.cron_post("/api/send-warmup", json!({})).await.json().await.unwrap();
    assert_eq!(third["sent"], 0);

    // Ann replies on-thread, Bob bounces
    h.mailbox.deliver(FetchedMessage {
        from: Some("ann@x.com".into()),
        subject: Some("Re: Hello".into()),
        in_reply_to: Some(ann_message_id.clone()),
        body: "Sounds interesting".into(),
        ..Default::default()
    });
    h.mailbox.deliver(FetchedMessage {
        from: Some("Mail Delivery Subsystem <mailer-daemon@x.com>".into()),
        subject: Some("Delivery Status Notification (Failure)".into()),
        body: "Address not found: bob@x.com".into(),
        ..Default::default()
    });

    // An empty body falls back to the warmup mailbox
    let resp = h
        .client
        .post(h.url("/api/check-responses"))
        .header(CRON_SECRET_HEADER, CRON)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["mailbox"], "warm@acme.io");
    assert_eq!(report["responsesFound"], 1);
    assert_eq!(report["bouncesFound"], 1);

    // Follow-up goes to Ann with the responder template, threaded
    let resp = h
        .cron_post("/api/send-followup", json!({"skipWait": true}))
        .await;
    let followup: Value = resp.json().await.unwrap();
    assert_eq!(followup["sent"], 1);
    assert_eq!(followup["details"][0]["email"], "ann@x.com");
    assert_eq!(followup["details"][0]["template"], "secondEmailResponders");
    assert_eq!(followup["details"][0]["threaded"], true);
    {
        let sent = h.transport.sent.lock().unwrap();
        let last = sent.last().unwrap();
        assert_eq!(last.in_reply_to.as_deref(), Some(ann_message_id.as_str()));
        assert_eq!(last.from_email, "final@acme.io");
    }

    // Bob is bounced: never followed up
    let again: Value = h
        .cron_post("/api/send-followup", json!({"skipWait": true}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(again["sent"], 0);

    let stats: Value = h.cron_get("/api/stats").await.json().await.unwrap();
    assert_eq!(stats["secondSent"], 1);
    assert_eq!(stats["bounced"], 1);
    assert_eq!(stats["total"], 2);
}

#[tokio::test]
async fn follow_up_respects_wait_window() {
    let h = start_server().await;
    configure(&h).await;
    submit(&h, json!({"email": "ann@x.com", "secret": SUBMIT})).await;
    h.cron_post("/api/send-warmup", json!({})).await;

    // Sent moments ago: not yet due with the default wait
    let report: Value = h
        .client
        .post(h.url("/api/send-followup"))
        .header(CRON_SECRET_HEADER, CRON)
        .body("not json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["sent"], 0);

    let report: Value = h
        .cron_post("/api/send-followup", json!({"waitDays": 0}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(report["sent"], 1);
    assert_eq!(report["details"][0]["template"], "secondEmailNonResponders");
}

#[tokio::test]
async fn operator_api() {
    let h = start_server().await;
    configure(&h).await;

    // Import
    let resp = h
        .client
        .post(h.url("/api/recipients/import"))
        .header(CRON_SECRET_HEADER, CRON)
        .body("Ann, ann@x.com, Acme\nbroken line\nBob, bob@x.com\n")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["inserted"], 2);
    assert_eq!(report["errors"].as_array().unwrap().len(), 1);

    let recipients: Value = h.cron_get("/api/recipients").await.json().await.unwrap();
    let id = recipients[0]["id"].as_i64().unwrap();
    let one: Value = h.cron_get(&format!("/api/recipients/{id}")).await.json().await.unwrap();
    assert_eq!(one["email"], "ann@x.com");
    assert_eq!(one["company"], "Acme");
    assert_eq!(h.cron_get("/api/recipients/9999").await.status(), 404);

    // Credentials never expose passwords
    let creds: Value = h.cron_get("/api/credentials").await.json().await.unwrap();
    assert_eq!(creds.as_array().unwrap().len(), 2);
    assert!(creds[0]["smtp"].get("password").is_none());
    assert!(!creds.to_string().contains("\"pw\""));

    // A second active version replaces the first
    let v2: Value = h
        .cron_post(
            "/api/templates",
            json!({"name": "firstEmail", "active": true, "subject": "v2", "body": "v2"}),
        )
        .await
        .json()
        .await
        .unwrap();
    let templates: Value = h.cron_get("/api/templates").await.json().await.unwrap();
    let active: Vec<&Value> = templates
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["name"] == "firstEmail" && t["active"] == true)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["id"], v2["id"]);

    let resp = h.cron_post("/api/templates/9999/activate", json!({})).await;
    assert_eq!(resp.status(), 404);
}
