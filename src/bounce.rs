use crate::address::normalize;
use crate::ledger::{FailureReason, SendLedger};
use mailparse::ParsedMail;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

/// Deduplicated bounced addresses, normalized.
pub type BounceSet = BTreeSet<String>;

#[derive(Debug, thiserror::Error)]
pub enum BounceError {
    #[error("Mailbox TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("Mailbox error: {0}")]
    Imap(#[from] imap::Error),
    #[error("Failed to parse notification: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("Mailbox scan task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BounceCheckConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub mailbox: String,
    pub subject: String,
}

impl Default for BounceCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "imap.gmail.com".to_string(),
            port: 993,
            mailbox: "INBOX".to_string(),
            subject: "Delivery Status Notification".to_string(),
        }
    }
}

/// Supplies raw delivery-failure notifications.
pub trait BounceSource: Send + Sync {
    fn fetch_notifications(&self) -> Result<Vec<Vec<u8>>, BounceError>;
}

/// Read-only IMAP mailbox over implicit TLS.
pub struct ImapBounceSource {
    config: BounceCheckConfig,
    username: String,
    password: String,
}

impl ImapBounceSource {
    pub fn new(config: BounceCheckConfig, username: &str, password: &str) -> Self {
        Self {
            config,
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl BounceSource for ImapBounceSource {
    fn fetch_notifications(&self) -> Result<Vec<Vec<u8>>, BounceError> {
        let host = self.config.host.as_str();
        let tls = native_tls::TlsConnector::builder().build()?;
        let client = imap::connect((host, self.config.port), host, &tls)?;
        let mut session = client
            .login(&self.username, &self.password)
            .map_err(|(e, _client)| e)?;

        session.examine(&self.config.mailbox)?;
        let query = format!("SUBJECT \"{}\"", self.config.subject.replace('"', ""));
        let mut sequence: Vec<u32> = session.search(&query)?.into_iter().collect();
        sequence.sort_unstable();
        log::debug!("Mailbox search '{query}' matched {} messages", sequence.len());

        let mut messages = Vec::with_capacity(sequence.len());
        if !sequence.is_empty() {
            let set = sequence
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            for fetch in session.fetch(set, "RFC822")?.iter() {
                if let Some(body) = fetch.body() {
                    messages.push(body.to_vec());
                }
            }
        }

        session.logout()?;
        Ok(messages)
    }
}

fn final_recipient_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)Final-Recipient:.*?;\s*(\S+@\S+)").expect("static pattern")
    })
}

/// Addresses named in `Final-Recipient` fields, in order of appearance.
pub fn extract_final_recipients(text: &str) -> Vec<String> {
    final_recipient_pattern()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            let raw = m.as_str();
            normalize(raw.trim_matches(|c: char| matches!(c, '<' | '>' | ',' | ';' | '.')))
        })
        .filter(|address| !address.is_empty())
        .collect()
}

/// Text of a notification that can carry a failure report: every
/// `text/plain` and `message/delivery-status` part of a multipart message,
/// or the whole body of a single-part one.
pub fn notification_text(raw: &[u8]) -> Result<String, BounceError> {
    let parsed = mailparse::parse_mail(raw)?;
    if parsed.subparts.is_empty() {
        return Ok(parsed.get_body()?);
    }

    let mut text = String::new();
    collect_report_parts(&parsed, &mut text);
    Ok(text)
}

fn collect_report_parts(part: &ParsedMail<'_>, out: &mut String) {
    if part.subparts.is_empty() {
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        if mimetype == "text/plain" || mimetype == "message/delivery-status" {
            match part.get_body() {
                Ok(body) => {
                    out.push_str(&body);
                    out.push('\n');
                }
                Err(e) => log::debug!("Skipping undecodable {mimetype} part: {e}"),
            }
        }
        return;
    }
    for sub in &part.subparts {
        collect_report_parts(sub, out);
    }
}

/// Fetch notifications and extract the bounced addresses.
///
/// Mailbox I/O runs on the blocking pool. A notification that cannot be
/// parsed is skipped; connection and protocol failures are returned.
pub async fn scan_for_bounces(source: Arc<dyn BounceSource>) -> Result<BounceSet, BounceError> {
    let messages = tokio::task::spawn_blocking(move || source.fetch_notifications())
        .await
        .map_err(|e| BounceError::Task(e.to_string()))??;

    let mut bounced = BounceSet::new();
    for raw in &messages {
        match notification_text(raw) {
            Ok(text) => bounced.extend(extract_final_recipients(&text)),
            Err(e) => log::warn!("Skipping unreadable delivery notification: {e}"),
        }
    }
    log::debug!(
        "Scanned {} notifications, {} distinct bounced addresses",
        messages.len(),
        bounced.len()
    );
    Ok(bounced)
}

/// Move bounced addresses from sent to failed (`bounce`). Returns the
/// addresses that were actually reconciled.
pub fn reconcile(ledger: &mut SendLedger, bounces: &BounceSet) -> Vec<String> {
    let mut reconciled = Vec::new();
    for address in bounces {
        if ledger.remove_sent(address).is_some() {
            ledger.record_failed(address, FailureReason::Bounce);
            log::info!("🧹 Removed bounced address {address} from sent log");
            reconciled.push(address.clone());
        }
    }
    reconciled
}
