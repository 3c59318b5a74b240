//! Lead intake: single submissions and line-oriented bulk import.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::model::{NewRecipient, Recipient};
use crate::error::{DatabaseError, IntakeError};
use crate::store::Database;

/// Body of a lead submission. The secret is checked by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadSubmission {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Reject empty or syntactically invalid addresses.
pub fn validate_email(email: &str) -> Result<(), IntakeError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(IntakeError::MissingEmail);
    }
    lettre::Address::from_str(email)
        .map(|_| ())
        .map_err(|e| IntakeError::InvalidEmail {
            address: email.to_string(),
            reason: e.to_string(),
        })
}

/// Validate and insert one lead as a `pending` recipient.
pub async fn submit_lead(
    db: &dyn Database,
    submission: &LeadSubmission,
) -> Result<Recipient, IntakeError> {
    let email = submission.email.as_deref().unwrap_or_default();
    validate_email(email)?;

    let new = NewRecipient {
        email: email.to_string(),
        name: submission.name.clone(),
        company: submission.company.clone(),
    };
    let recipient = db.insert_recipient(&new).await?;
    info!(recipient_id = recipient.id, email = %recipient.email, "Lead submitted");
    Ok(recipient)
}

/// One rejected import line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRowError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: u32,
    pub skipped: u32,
    pub total: u32,
    pub errors: Vec<ImportRowError>,
}

/// Parse one `name,email[,company]` line. Anything after the second comma
/// is the company, so `Acme, Inc.` survives intact.
fn parse_line(line: &str) -> Result<NewRecipient, String> {
    let mut fields = line.splitn(3, ',').map(str::trim);
    let (Some(name), Some(email)) = (fields.next(), fields.next()) else {
        return Err("expected name,email[,company]".to_string());
    };
    let company = fields.next();
    validate_email(email).map_err(|e| e.to_string())?;
    Ok(NewRecipient {
        email: email.to_string(),
        name: Some(name.to_string()),
        company: company.map(str::to_string),
    })
}

/// Import leads from text, one per line. Blank lines are ignored, malformed
/// rows are collected as errors, and existing emails count as skipped.
///
/// Only a database failure other than a duplicate aborts the import.
pub async fn import_leads(db: &dyn Database, text: &str) -> Result<ImportReport, DatabaseError> {
    let mut report = ImportReport::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.total += 1;

        let new = match parse_line(line) {
            Ok(new) => new,
            Err(message) => {
                report.errors.push(ImportRowError {
                    line: index + 1,
                    message,
                });
                continue;
            }
        };

        match db.insert_recipient(&new).await {
            Ok(_) => report.inserted += 1,
            Err(DatabaseError::DuplicateEmail(email)) => {
                warn!(email = %email, "Import skipped existing recipient");
                report.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        inserted = report.inserted,
        skipped = report.skipped,
        errors = report.errors.len(),
        "Lead import complete"
    );
    Ok(report)
}
