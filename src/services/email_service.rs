use crate::config::{ActivatorConfig, EmailConfig, SmtpEncryption};
use askama::Template;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Failed to build email message: {0}")]
    MessageBuild(String),
    #[error("Failed to send email: {0}")]
    SendFailed(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Record has no recipient email address")]
    MissingRecipient,
}

pub const APPROVAL_SUBJECT: &str = "Your Account Has Been Approved!";

/// The fixed account-approval message, rendered for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl ApprovalEmail {
    pub fn new(
        from_name: &str,
        from_email: &str,
        to_email: &str,
        recipient_name: &str,
    ) -> Result<Self, EmailError> {
        let text = format!(
            "Hi {}, your account has been verified and activated. You can now log in.",
            recipient_name
        );

        let html = ApprovalHtml {
            recipient_name,
            from_name,
        }
        .render()
        .map_err(|e| EmailError::MessageBuild(format!("Template error: {}", e)))?;

        Ok(Self {
            from: format!("\"{}\" <{}>", from_name, from_email),
            to: to_email.to_string(),
            subject: APPROVAL_SUBJECT.to_string(),
            text,
            html,
        })
    }
}

#[derive(Template)]
#[template(path = "email/approval.html")]
struct ApprovalHtml<'a> {
    recipient_name: &'a str,
    from_name: &'a str,
}

#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait EmailService: Send + Sync {
    /// Send the approval notice to `to_email`, greeting the user as `recipient_name`.
    async fn send_approval_email(
        &self,
        to_email: &str,
        recipient_name: &str,
    ) -> Result<(), EmailError>;
}

/// Logs every message instead of sending it. Used when no sender secrets are configured.
pub struct LogEmailService {
    from_name: String,
    from_email: String,
}

impl LogEmailService {
    pub fn new(from_name: impl Into<String>) -> Self {
        Self {
            from_name: from_name.into(),
            from_email: "noreply@localhost".to_string(),
        }
    }
}

impl Default for LogEmailService {
    fn default() -> Self {
        Self::new(crate::config::settings::DEFAULT_FROM_NAME)
    }
}

#[async_trait]
impl EmailService for LogEmailService {
    async fn send_approval_email(
        &self,
        to_email: &str,
        recipient_name: &str,
    ) -> Result<(), EmailError> {
        let email =
            ApprovalEmail::new(&self.from_name, &self.from_email, to_email, recipient_name)?;
        tracing::info!("📧 [LOG EMAIL] Approval email to: {}", email.to);
        tracing::info!("   From: {}", email.from);
        tracing::info!("   Subject: {}", email.subject);
        tracing::info!("   Body: {}", email.text);
        tracing::info!("   ---");
        Ok(())
    }
}

pub struct SmtpEmailService {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl SmtpEmailService {
    pub fn new(config: &EmailConfig) -> Result<Self, EmailError> {
        let credentials = Credentials::new(
            config.sender_email.clone(),
            config.sender_password.clone(),
        );

        let mailer = match config.encryption {
            SmtpEncryption::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| EmailError::ConfigError(format!("SMTP relay error: {}", e)))?
                .port(config.smtp_port)
                .credentials(credentials)
                .build(),
            SmtpEncryption::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                    .map_err(|e| EmailError::ConfigError(format!("SMTP starttls error: {}", e)))?
                    .port(config.smtp_port)
                    .credentials(credentials)
                    .build()
            }
            SmtpEncryption::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
                    .port(config.smtp_port)
                    .credentials(credentials)
                    .build()
            }
        };

        Ok(Self {
            mailer,
            from_email: config.sender_email.clone(),
            from_name: config.from_name.clone(),
        })
    }

    fn build_message(&self, email: &ApprovalEmail) -> Result<Message, EmailError> {
        let from_address: Address = self
            .from_email
            .parse()
            .map_err(|e| EmailError::MessageBuild(format!("Invalid from address: {}", e)))?;

        Message::builder()
            .from(Mailbox::new(Some(self.from_name.clone()), from_address))
            .to(email
                .to
                .parse()
                .map_err(|e| EmailError::MessageBuild(format!("Invalid to address: {}", e)))?)
            .subject(email.subject.clone())
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html.clone()),
                    ),
            )
            .map_err(|e| EmailError::MessageBuild(e.to_string()))
    }
}

#[async_trait]
impl EmailService for SmtpEmailService {
    async fn send_approval_email(
        &self,
        to_email: &str,
        recipient_name: &str,
    ) -> Result<(), EmailError> {
        let email =
            ApprovalEmail::new(&self.from_name, &self.from_email, to_email, recipient_name)?;
        let message = self.build_message(&email)?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| EmailError::SendFailed(e.to_string()))?;

        Ok(())
    }
}

pub fn create_email_service(config: &ActivatorConfig) -> Arc<dyn EmailService> {
    match &config.email {
        Some(email_config) => match SmtpEmailService::new(email_config) {
            Ok(service) => {
                tracing::info!(
                    "Using SMTP email service via {}:{}",
                    email_config.smtp_host,
                    email_config.smtp_port
                );
                Arc::new(service)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to initialize SMTP email service: {}. Falling back to log-only service",
                    e
                );
                Arc::new(LogEmailService::new(config.from_name.clone()))
            }
        },
        None => {
            tracing::info!(
                "GMAIL_EMAIL not configured. Using log-only email service \
                 (emails will be logged to console)"
            );
            Arc::new(LogEmailService::new(config.from_name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_email_interpolates_name() {
        let email =
            ApprovalEmail::new("ShieldUp Team", "team@shieldup.example", "a@b.com", "Al").unwrap();

        assert_eq!(email.from, "\"ShieldUp Team\" <team@shieldup.example>");
        assert_eq!(email.to, "a@b.com");
        assert_eq!(email.subject, "Your Account Has Been Approved!");
        assert_eq!(
            email.text,
            "Hi Al, your account has been verified and activated. You can now log in."
        );
        assert!(email.html.contains("<strong>Al</strong>"));
        assert!(email.html.contains("The ShieldUp Team"));
    }

    #[test]
    fn test_approval_email_escapes_html_name() {
        let email = ApprovalEmail::new(
            "ShieldUp Team",
            "team@shieldup.example",
            "a@b.com",
            "<b>Al</b>",
        )
        .unwrap();

        assert!(!email.html.contains("<b>Al</b>"));
        assert!(email.html.contains("Al"));
        assert!(email.text.contains("<b>Al</b>"));
    }

    #[test]
    fn test_smtp_message_builds_multipart() {
        let config = EmailConfig {
            sender_email: "team@shieldup.example".to_string(),
            sender_password: "secret".to_string(),
            from_name: "ShieldUp Team".to_string(),
            smtp_host: "localhost".to_string(),
            smtp_port: 2525,
            encryption: SmtpEncryption::None,
        };
        let service = SmtpEmailService::new(&config).unwrap();
        let email =
            ApprovalEmail::new("ShieldUp Team", "team@shieldup.example", "a@b.com", "Al").unwrap();

        let message = service.build_message(&email).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Subject: Your Account Has Been Approved!"));
        assert!(raw.contains("To: a@b.com"));
        assert!(raw.contains("multipart/alternative"));
    }

    #[test]
    fn test_smtp_message_rejects_invalid_recipient() {
        let config = EmailConfig {
            sender_email: "team@shieldup.example".to_string(),
            sender_password: "secret".to_string(),
            from_name: "ShieldUp Team".to_string(),
            smtp_host: "localhost".to_string(),
            smtp_port: 2525,
            encryption: SmtpEncryption::None,
        };
        let service = SmtpEmailService::new(&config).unwrap();
        let email = ApprovalEmail::new(
            "ShieldUp Team",
            "team@shieldup.example",
            "not-an-email",
            "Al",
        )
        .unwrap();

        assert!(matches!(
            service.build_message(&email),
            Err(EmailError::MessageBuild(_))
        ));
    }

    #[tokio::test]
    async fn test_log_email_service_always_succeeds() {
        let service = LogEmailService::default();
        assert!(service.send_approval_email("a@b.com", "Al").await.is_ok());
    }
}
