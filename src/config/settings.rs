use std::{env, str::FromStr, time::Duration};
use tracing::warn;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/activator.db";
pub const DEFAULT_PENDING_COLLECTION: &str = "pending_users";
pub const DEFAULT_VERIFIED_COLLECTION: &str = "verified_users";
pub const DEFAULT_CONSUMER: &str = "user-activator";
pub const DEFAULT_FROM_NAME: &str = "ShieldUp Team";

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const MIN_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_BATCH_SIZE: i64 = 100;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// How the migrator relocates a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationMode {
    /// Existence read, write, delete as three separate store calls.
    #[default]
    Sequential,
    /// Existence check, write and delete inside one store transaction.
    Transactional,
}

impl FromStr for MigrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "transactional" => Ok(Self::Transactional),
            other => Err(format!(
                "{} is not a supported migration mode. Use 'sequential' or 'transactional'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpEncryption {
    Tls,
    StartTls,
    None,
}

impl FromStr for SmtpEncryption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tls" => Ok(Self::Tls),
            "starttls" => Ok(Self::StartTls),
            "none" => Ok(Self::None),
            other => Err(format!(
                "Invalid SMTP_ENCRYPTION value: {}. Use 'tls', 'starttls', or 'none'",
                other
            )),
        }
    }
}

/// Sender identity and transport settings.
///
/// `sender_email` and `sender_password` come from the `GMAIL_EMAIL` and
/// `GMAIL_PASSWORD` secrets.
#[derive(Clone)]
pub struct EmailConfig {
    pub sender_email: String,
    pub sender_password: String,
    pub from_name: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub encryption: SmtpEncryption,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("sender_email", &self.sender_email)
            .field("sender_password", &"<redacted>")
            .field("from_name", &self.from_name)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("encryption", &self.encryption)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ActivatorConfig {
    pub database_url: String,
    pub pending_collection: String,
    pub verified_collection: String,
    pub migration_mode: MigrationMode,
    pub consumer: String,
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// `None` means no sender secrets were provided; mail is logged instead of sent.
    pub email: Option<EmailConfig>,
    pub from_name: String,
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            pending_collection: DEFAULT_PENDING_COLLECTION.to_string(),
            verified_collection: DEFAULT_VERIFIED_COLLECTION.to_string(),
            migration_mode: MigrationMode::default(),
            consumer: DEFAULT_CONSUMER.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            email: None,
            from_name: DEFAULT_FROM_NAME.to_string(),
        }
    }
}

impl ActivatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let migration_mode = match env::var("MIGRATION_MODE") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "MIGRATION_MODE",
                value,
            })?,
            Err(_) => defaults.migration_mode,
        };

        let poll_interval_ms = parse_var("CHANGE_FEED_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?
            .max(MIN_POLL_INTERVAL_MS);

        let batch_size = parse_var("CHANGE_FEED_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size <= 0 {
            return Err(ConfigError::Invalid {
                key: "CHANGE_FEED_BATCH_SIZE",
                value: batch_size.to_string(),
            });
        }

        let from_name = non_empty_var("MAIL_FROM_NAME").unwrap_or(defaults.from_name);
        let email = EmailConfig::from_env(&from_name)?;

        if email.is_none() && current_environment() == "production" {
            return Err(ConfigError::Missing("GMAIL_EMAIL"));
        }

        Ok(Self {
            database_url: non_empty_var("DATABASE_URL").unwrap_or(defaults.database_url),
            pending_collection: non_empty_var("PENDING_COLLECTION")
                .unwrap_or(defaults.pending_collection),
            verified_collection: non_empty_var("VERIFIED_COLLECTION")
                .unwrap_or(defaults.verified_collection),
            migration_mode,
            consumer: non_empty_var("CHANGE_FEED_CONSUMER").unwrap_or(defaults.consumer),
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            email,
            from_name,
        })
    }
}

impl EmailConfig {
    /// `Ok(None)` when `GMAIL_EMAIL` is unset; a half-configured sender is an error.
    fn from_env(from_name: &str) -> Result<Option<Self>, ConfigError> {
        let Some(sender_email) = non_empty_var("GMAIL_EMAIL") else {
            if non_empty_var("GMAIL_PASSWORD").is_some() {
                warn!("GMAIL_PASSWORD is set without GMAIL_EMAIL; ignoring it");
            }
            return Ok(None);
        };
        let sender_password =
            non_empty_var("GMAIL_PASSWORD").ok_or(ConfigError::Missing("GMAIL_PASSWORD"))?;

        let encryption = match env::var("SMTP_ENCRYPTION") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "SMTP_ENCRYPTION",
                value,
            })?,
            Err(_) => SmtpEncryption::Tls,
        };

        Ok(Some(Self {
            sender_email,
            sender_password,
            from_name: from_name.to_string(),
            smtp_host: non_empty_var("SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".to_string()),
            smtp_port: parse_var("SMTP_PORT", 465)?,
            encryption,
        }))
    }
}

fn current_environment() -> String {
    env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
