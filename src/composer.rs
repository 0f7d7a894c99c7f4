use crate::contacts::Contact;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SUBJECT: &str = "An introduction for {organization}";

pub const DEFAULT_TEXT_TEMPLATE: &str = "\
Dear {salutation},

My name is {sender_name}, and I am reaching out to {organization} to introduce a tool built to make day-to-day campus operations simpler for staff and students.

If it sounds useful, just reply to this message and I will gladly answer any questions personally.

Thank you for the work you do for your students.

If you'd prefer not to receive future updates, just reply with \"unsubscribe\".

Warmly,
{sender_name}
";

pub const DEFAULT_HTML_TEMPLATE: &str = "\
<html>
  <body style=\"font-family: Arial, sans-serif; color: #333;\">
    <p>Dear {salutation},</p>
    <p>My name is {sender_name}, and I am reaching out to <strong>{organization}</strong> to introduce a tool built to make day-to-day campus operations simpler for staff and students.</p>
    <p>If it sounds useful, just reply to this message and I will gladly answer any questions personally.</p>
    <p>Thank you for the work you do for your students.</p>
    <p><em>If you'd prefer not to receive future updates, just reply with \"unsubscribe\".</em></p>
    <p>Warmly,<br>{sender_name}</p>
  </body>
</html>
";

/// Message text configuration. Each template may be given inline or loaded
/// from a file; the file wins when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub subject: String,
    pub text_template: Option<String>,
    pub text_template_file: Option<PathBuf>,
    pub html_template: Option<String>,
    pub html_template_file: Option<PathBuf>,
    pub fallback_title: String,
    pub fallback_organization: String,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            text_template: None,
            text_template_file: None,
            html_template: None,
            html_template_file: None,
            fallback_title: "Principal".to_string(),
            fallback_organization: "your school".to_string(),
        }
    }
}

/// A fully rendered message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutreachEmail {
    pub from_name: String,
    pub from_address: String,
    pub reply_to: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct MessageComposer {
    sender_name: String,
    sender_address: String,
    subject: String,
    text_template: String,
    html_template: String,
    fallback_title: String,
    fallback_organization: String,
}

impl MessageComposer {
    pub fn new(sender_name: &str, sender_address: &str, config: &MessageConfig) -> anyhow::Result<Self> {
        let text_template = resolve_template(
            &config.text_template_file,
            &config.text_template,
            DEFAULT_TEXT_TEMPLATE,
        )?;
        let html_template = resolve_template(
            &config.html_template_file,
            &config.html_template,
            DEFAULT_HTML_TEMPLATE,
        )?;

        Ok(Self {
            sender_name: sender_name.to_string(),
            sender_address: sender_address.to_string(),
            subject: config.subject.clone(),
            text_template,
            html_template,
            fallback_title: config.fallback_title.clone(),
            fallback_organization: config.fallback_organization.clone(),
        })
    }

    pub fn compose(&self, contact: &Contact) -> OutreachEmail {
        let salutation = format_salutation(&contact.name, &self.fallback_title);
        let organization = format_organization(&contact.organization, &self.fallback_organization);

        let plain = |template: &str| {
            template
                .replace("{salutation}", &salutation)
                .replace("{organization}", &organization)
                .replace("{sender_name}", &self.sender_name)
        };
        let html = self
            .html_template
            .replace("{salutation}", &escape_html(&salutation))
            .replace("{organization}", &escape_html(&organization))
            .replace("{sender_name}", &escape_html(&self.sender_name));

        OutreachEmail {
            from_name: self.sender_name.clone(),
            from_address: self.sender_address.clone(),
            reply_to: self.sender_address.clone(),
            to: contact.email.trim().to_string(),
            subject: plain(&self.subject),
            text: plain(&self.text_template),
            html,
        }
    }
}

fn resolve_template(
    file: &Option<PathBuf>,
    inline: &Option<String>,
    default: &str,
) -> anyhow::Result<String> {
    if let Some(path) = file {
        return std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read template {}: {e}", path.display()));
    }
    Ok(inline.clone().unwrap_or_else(|| default.to_string()))
}

/// "MR JOHN SMITH" -> "Mr. Smith"; unknown prefixes use the fallback title.
pub fn format_salutation(name: &str, fallback_title: &str) -> String {
    let parts: Vec<&str> = name.split_whitespace().collect();
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return fallback_title.to_string();
    };

    let title = match first.trim_end_matches('.').to_uppercase().as_str() {
        "MR" => "Mr.",
        "MRS" => "Mrs.",
        "MS" => "Ms.",
        _ => fallback_title,
    };
    format!("{title} {}", capitalize(last))
}

/// Title-case an organization name, or the fallback when empty.
pub fn format_organization(organization: &str, fallback: &str) -> String {
    let organization = organization.trim();
    if organization.is_empty() {
        return fallback.to_string();
    }
    organization
        .split_whitespace()
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
