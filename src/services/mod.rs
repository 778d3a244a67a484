pub mod activation_service;
pub mod email_service;
pub mod record_migrator;
pub mod transition_detector;

pub use activation_service::{ActivationOutcome, ActivationService, ActivationState};
pub use email_service::{
    create_email_service, ApprovalEmail, EmailError, EmailService, LogEmailService,
    SmtpEmailService,
};
pub use record_migrator::{MigrationError, MigrationOutcome, RecordMigrator};
pub use transition_detector::is_verification_transition;
