use crate::models::{ChangeEvent, UserRecord};
use crate::services::email_service::{EmailError, EmailService};
use crate::services::record_migrator::{MigrationError, MigrationOutcome, RecordMigrator};
use crate::services::transition_detector::is_verification_transition;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Per-event progress of the activation handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Idle,
    Detecting,
    Migrating,
    Notifying,
    Done,
    Failed,
}

/// Terminal result of handling one change event.
#[derive(Debug)]
pub enum ActivationOutcome {
    /// Not a `verified` false → true edge; nothing happened.
    Ignored,
    /// The pending record was already gone; nothing was written or sent.
    AlreadyActivated,
    Activated { approved_at: DateTime<Utc> },
    /// The record was not migrated and no email was sent.
    MigrationFailed(MigrationError),
    /// The record was migrated but the user was not notified.
    NotificationFailed {
        approved_at: DateTime<Utc>,
        error: EmailError,
    },
}

impl ActivationOutcome {
    pub fn final_state(&self) -> ActivationState {
        match self {
            ActivationOutcome::Ignored => ActivationState::Idle,
            ActivationOutcome::AlreadyActivated | ActivationOutcome::Activated { .. } => {
                ActivationState::Done
            }
            ActivationOutcome::MigrationFailed(_)
            | ActivationOutcome::NotificationFailed { .. } => ActivationState::Failed,
        }
    }

    pub fn is_migrated(&self) -> bool {
        matches!(
            self,
            ActivationOutcome::Activated { .. } | ActivationOutcome::NotificationFailed { .. }
        )
    }
}

/// Detect → migrate → notify for a single change event.
///
/// Failures are logged and reported through [`ActivationOutcome`]; they are
/// never retried and a notification failure never undoes the migration.
pub struct ActivationService {
    migrator: RecordMigrator,
    email_service: Arc<dyn EmailService>,
}

impl ActivationService {
    pub fn new(migrator: RecordMigrator, email_service: Arc<dyn EmailService>) -> Self {
        Self {
            migrator,
            email_service,
        }
    }

    #[tracing::instrument(
        name = "activation",
        skip(self, event),
        fields(user_id = %event.document_id, seq = event.seq)
    )]
    pub async fn handle_event(&self, event: &ChangeEvent) -> ActivationOutcome {
        let mut state = ActivationState::Detecting;
        tracing::trace!(?state);

        if !is_verification_transition(event.before.as_ref(), event.after.as_ref()) {
            return ActivationOutcome::Ignored;
        }
        let Some(after) = event.after.as_ref() else {
            return ActivationOutcome::Ignored;
        };
        let user_id = event.document_id.as_str();

        state = ActivationState::Migrating;
        tracing::debug!(?state, "Verification transition detected");

        let approved_at = match self.migrator.migrate(user_id, after).await {
            Ok(MigrationOutcome::Migrated(written)) => written.update_time,
            Ok(MigrationOutcome::AlreadyMigrated) => {
                tracing::debug!("Pending record no longer exists; skipping");
                return ActivationOutcome::AlreadyActivated;
            }
            Err(e) => {
                tracing::error!("Error during user verification and email sending: {}", e);
                return ActivationOutcome::MigrationFailed(e);
            }
        };

        tracing::info!(
            "User {} moved to {} and activated.",
            user_id,
            self.migrator.verified_collection()
        );

        state = ActivationState::Notifying;
        tracing::debug!(?state);

        let record = UserRecord::new(after);
        let result = match record.email() {
            Some(email) => self
                .email_service
                .send_approval_email(email, record.display_name())
                .await
                .map(|()| email),
            None => Err(EmailError::MissingRecipient),
        };

        match result {
            Ok(email) => {
                tracing::info!("Verification email sent to {}", email);
                ActivationOutcome::Activated { approved_at }
            }
            Err(error) => {
                tracing::error!(
                    "Error during user verification and email sending: {}",
                    error
                );
                ActivationOutcome::NotificationFailed { approved_at, error }
            }
        }
    }
}
