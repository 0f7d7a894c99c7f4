use crate::bounce::BounceCheckConfig;
use crate::composer::MessageConfig;
use crate::contacts::ContactColumns;
use crate::gate::{SendWindow, WarmupSchedule};
use crate::transport::SmtpConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CREDENTIALS_ADDRESS_VAR: &str = "EMAIL_USER";
pub const CREDENTIALS_SECRET_VAR: &str = "EMAIL_PASS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sender: SenderConfig,
    pub schedule: ScheduleConfig,
    pub warmup: WarmupSchedule,
    pub smtp: SmtpConfig,
    pub bounce_check: BounceCheckConfig,
    pub files: FileConfig,
    pub contacts: ContactColumns,
    pub message: MessageConfig,
    /// Never read from or written to the config file
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub display_name: String,
    /// Defaults to the credentials address when unset
    pub address: Option<String>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            display_name: "Outreach Team".to_string(),
            address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub send_start_hour: u32,
    pub send_end_hour: u32,
    pub inter_send_delay_seconds: u64,
    pub window_poll_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            send_start_hour: 8,
            send_end_hour: 9,
            inter_send_delay_seconds: 10,
            window_poll_seconds: 60,
        }
    }
}

impl ScheduleConfig {
    pub fn window(&self) -> SendWindow {
        SendWindow::new(self.send_start_hour, self.send_end_hour)
    }

    pub fn inter_send_delay(&self) -> Duration {
        Duration::from_secs(self.inter_send_delay_seconds)
    }

    pub fn window_poll_interval(&self) -> Duration {
        Duration::from_secs(self.window_poll_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub contacts: PathBuf,
    pub sent_log: PathBuf,
    pub failed_log: PathBuf,
    pub error_log: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            contacts: PathBuf::from("Directory.csv"),
            sent_log: PathBuf::from("sent_log.json"),
            failed_log: PathBuf::from("failed_log.json"),
            error_log: PathBuf::from("error_log.json"),
        }
    }
}

/// Transport and mailbox login.
#[derive(Clone)]
pub struct Credentials {
    pub address: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("send_start_hour must be 0-23 (got {0})")]
    InvalidStartHour(u32),
    #[error("send_end_hour must be 0-24 (got {0})")]
    InvalidEndHour(u32),
    #[error("sending window is empty: start and end hour are both {0}")]
    EmptyWindow(u32),
    #[error("warmup.absolute_ceiling must be greater than zero")]
    ZeroCeiling,
    #[error("message.subject must not be empty")]
    EmptySubject,
    #[error("missing credentials: set EMAIL_USER and EMAIL_PASS")]
    MissingCredentials,
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Pick up credentials from the environment, including a `.env` file
    /// in the working directory if present.
    pub fn with_env_credentials(mut self) -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                log::warn!("Ignoring unreadable .env file: {e}");
            }
        }
        let address = std::env::var(CREDENTIALS_ADDRESS_VAR).ok();
        let secret = std::env::var(CREDENTIALS_SECRET_VAR).ok();
        log::info!(
            "🔐 {CREDENTIALS_ADDRESS_VAR} loaded: {}",
            if address.is_some() { "yes" } else { "no" }
        );
        log::info!(
            "🔐 {CREDENTIALS_SECRET_VAR} loaded: {}",
            if secret.is_some() { "yes" } else { "no" }
        );
        self.credentials = match (address, secret) {
            (Some(address), Some(secret)) if !address.is_empty() && !secret.is_empty() => {
                Some(Credentials { address, secret })
            }
            _ => None,
        };
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let schedule = &self.schedule;
        if schedule.send_start_hour > 23 {
            return Err(ConfigError::InvalidStartHour(schedule.send_start_hour));
        }
        if schedule.send_end_hour > 24 {
            return Err(ConfigError::InvalidEndHour(schedule.send_end_hour));
        }
        if schedule.send_start_hour == schedule.send_end_hour {
            return Err(ConfigError::EmptyWindow(schedule.send_start_hour));
        }
        if self.warmup.absolute_ceiling == 0 {
            return Err(ConfigError::ZeroCeiling);
        }
        if self.message.subject.trim().is_empty() {
            return Err(ConfigError::EmptySubject);
        }
        Ok(())
    }

    pub fn require_credentials(&self) -> Result<&Credentials, ConfigError> {
        self.credentials.as_ref().ok_or(ConfigError::MissingCredentials)
    }

    /// Address messages are sent from
    pub fn sender_address(&self) -> Option<String> {
        self.sender
            .address
            .clone()
            .or_else(|| self.credentials.as_ref().map(|c| c.address.clone()))
    }
}
