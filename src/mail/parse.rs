//! Turning raw RFC 5322 bytes into a [`FetchedMessage`].
//!
//! Threading headers are read verbatim from the raw header block so that
//! `In-Reply-To` keeps its angle brackets and compares byte-for-byte with the
//! Message-ID we stored. Everything else goes through mail-parser.

use mail_parser::{MessageParser, MimeHeaders};

use super::FetchedMessage;

/// Parse a fetched message. Unparseable input still yields a message whose
/// body is the lossy text of the raw bytes.
pub fn parse_message(uid: u32, raw: &[u8]) -> FetchedMessage {
    let in_reply_to = raw_header(raw, "In-Reply-To");
    let references = raw_header(raw, "References");

    match MessageParser::default().parse(raw) {
        Some(parsed) => FetchedMessage {
            uid,
            from: extract_sender(&parsed),
            subject: parsed.subject().map(str::to_string),
            in_reply_to,
            references,
            body: extract_text(&parsed),
        },
        None => FetchedMessage {
            uid,
            in_reply_to,
            references,
            body: String::from_utf8_lossy(raw).into_owned(),
            ..Default::default()
        },
    }
}

/// Value of the first header called `name` (case-insensitive), unfolded and
/// trimmed. `None` if absent or empty.
pub fn raw_header(raw: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut current: Option<String> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(value) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if current.is_some() {
            break;
        }
        if let Some((key, value)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case(name)
        {
            current = Some(value.trim().to_string());
        }
    }

    current.filter(|v| !v.is_empty())
}

/// Sender address of a parsed message.
fn extract_sender(parsed: &mail_parser::Message) -> Option<String> {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
}

/// Readable text from a parsed message: plain part, else stripped HTML, else
/// the first textual attachment.
pub fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
