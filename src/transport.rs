use crate::composer::OutreachEmail;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SMTP connection failed: {0}")]
    Connection(String),
    #[error("SMTP authentication failed: {0}")]
    Authentication(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Failed to build message: {0}")]
    Build(String),
    #[error("Send failed: {0}")]
    Send(String),
}

/// Outbound delivery for rendered messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate once, before any send is attempted.
    async fn verify(&self) -> Result<(), TransportError>;

    async fn send(&self, email: &OutreachEmail) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            timeout_seconds: 30,
        }
    }
}

/// STARTTLS + authenticated SMTP relay.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig, username: &str, password: &str) -> Result<Self, TransportError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_seconds)))
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();

        Ok(Self {
            transport,
            host: format!("{}:{}", config.host, config.port),
        })
    }

    fn build_message(email: &OutreachEmail) -> Result<Message, TransportError> {
        let from_address: lettre::Address = email
            .from_address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(email.from_address.clone()))?;
        let from = Mailbox::new(Some(email.from_name.clone()), from_address);
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|_| TransportError::InvalidAddress(email.to.clone()))?;
        let reply_to: Mailbox = email
            .reply_to
            .parse()
            .map_err(|_| TransportError::InvalidAddress(email.reply_to.clone()))?;

        Message::builder()
            .from(from)
            .to(to)
            .reply_to(reply_to)
            .subject(email.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                email.text.clone(),
                email.html.clone(),
            ))
            .map_err(|e| TransportError::Build(e.to_string()))
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn verify(&self) -> Result<(), TransportError> {
        log::info!("🌐 Connecting to SMTP server {}...", self.host);
        match self.transport.test_connection().await {
            Ok(true) => {
                log::info!("✅ SMTP connected");
                Ok(())
            }
            Ok(false) => Err(TransportError::Connection(format!(
                "{} did not accept the connection",
                self.host
            ))),
            Err(e) if e.is_permanent() => Err(TransportError::Authentication(e.to_string())),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }

    async fn send(&self, email: &OutreachEmail) -> Result<(), TransportError> {
        let message = Self::build_message(email)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }
}
