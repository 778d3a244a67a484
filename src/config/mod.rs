pub mod settings;

pub use settings::{ActivatorConfig, ConfigError, EmailConfig, MigrationMode, SmtpEncryption};
