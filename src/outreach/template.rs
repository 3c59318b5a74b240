//! Template rendering: literal `{{key}}` substitution against recipient variables.
//!
//! Pure string replacement, no expression evaluation. Placeholders without a
//! matching variable are left in the output verbatim.

use super::model::{Recipient, Template};

/// Sender name used when a template does not set one.
pub const DEFAULT_SENDER_NAME: &str = "Sender";

/// Variables available to a template, in substitution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars(Vec<(&'static str, String)>);

impl TemplateVars {
    /// Build the variable set for one recipient and the template's sender fields.
    pub fn for_recipient(recipient: &Recipient, template: &Template) -> Self {
        let name = recipient.name.clone().unwrap_or_default();
        let first_name = name.split_whitespace().next().unwrap_or_default().to_string();
        let sender_name = template
            .sender_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SENDER_NAME)
            .to_string();

        Self(vec![
            ("name", name.clone()),
            ("Name", name),
            ("firstName", first_name),
            ("email", recipient.email.clone()),
            ("company", recipient.company.clone().unwrap_or_default()),
            ("senderName", sender_name),
            (
                "senderCompany",
                template.sender_company.clone().unwrap_or_default(),
            ),
        ])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Replace every `{{key}}` occurrence for each variable.
pub fn render(text: &str, vars: &TemplateVars) -> String {
    let mut out = text.to_string();
    for (key, value) in vars.iter() {
        let placeholder = format!("{{{{{key}}}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

/// Subject and body after substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
    pub sender_name: String,
}

/// Render a template's subject and body for a recipient.
pub fn render_for(template: &Template, recipient: &Recipient) -> RenderedMessage {
    let vars = TemplateVars::for_recipient(recipient, template);
    RenderedMessage {
        subject: render(&template.subject, &vars),
        body: render(&template.body, &vars),
        sender_name: vars
            .get("senderName")
            .unwrap_or(DEFAULT_SENDER_NAME)
            .to_string(),
    }
}
