use crate::config::MigrationMode;
use crate::models::{verified_record, Document, WriteResult};
use crate::repositories::{DocumentStore, RepositoryError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Failed to read pending record: {0}")]
    ReadFailed(#[source] RepositoryError),
    #[error("Failed to write verified record: {0}")]
    WriteFailed(#[source] RepositoryError),
    #[error("Failed to delete pending record: {0}")]
    DeleteFailed(#[source] RepositoryError),
    #[error("Failed to move record: {0}")]
    MoveFailed(#[source] RepositoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The verified record was written and the pending record removed.
    Migrated(WriteResult),
    /// No pending record exists any more; nothing was written.
    AlreadyMigrated,
}

/// Moves a user record from the pending collection to the verified one.
pub struct RecordMigrator {
    store: Arc<dyn DocumentStore>,
    pending_collection: String,
    verified_collection: String,
    mode: MigrationMode,
}

impl RecordMigrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        pending_collection: impl Into<String>,
        verified_collection: impl Into<String>,
        mode: MigrationMode,
    ) -> Self {
        Self {
            store,
            pending_collection: pending_collection.into(),
            verified_collection: verified_collection.into(),
            mode,
        }
    }

    pub fn verified_collection(&self) -> &str {
        &self.verified_collection
    }

    /// Relocate `user_id` using the `after` snapshot as the record's fields.
    pub async fn migrate(
        &self,
        user_id: &str,
        after: &Document,
    ) -> Result<MigrationOutcome, MigrationError> {
        match self.mode {
            MigrationMode::Sequential => self.migrate_sequential(user_id, after).await,
            MigrationMode::Transactional => self.migrate_transactional(user_id, after).await,
        }
    }

    async fn migrate_sequential(
        &self,
        user_id: &str,
        after: &Document,
    ) -> Result<MigrationOutcome, MigrationError> {
        let pending = self
            .store
            .get(&self.pending_collection, user_id)
            .await
            .map_err(MigrationError::ReadFailed)?;

        if pending.is_none() {
            return Ok(MigrationOutcome::AlreadyMigrated);
        }

        // Write before delete: a crash in between leaves a duplicate, never a lost record.
        let written = self
            .store
            .set(&self.verified_collection, user_id, verified_record(after))
            .await
            .map_err(MigrationError::WriteFailed)?;

        let removed = self
            .store
            .delete(&self.pending_collection, user_id)
            .await
            .map_err(MigrationError::DeleteFailed)?;

        if !removed {
            tracing::warn!(
                user_id = %user_id,
                "Pending record disappeared before it could be deleted"
            );
        }

        Ok(MigrationOutcome::Migrated(written))
    }

    async fn migrate_transactional(
        &self,
        user_id: &str,
        after: &Document,
    ) -> Result<MigrationOutcome, MigrationError> {
        let moved = self
            .store
            .move_document(
                &self.pending_collection,
                &self.verified_collection,
                user_id,
                verified_record(after),
            )
            .await
            .map_err(MigrationError::MoveFailed)?;

        Ok(match moved {
            Some(written) => MigrationOutcome::Migrated(written),
            None => MigrationOutcome::AlreadyMigrated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::document_repository::MockDocumentStore;
    use chrono::Utc;
    use mockall::predicate::*;
    use mockall::Sequence;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object literal")
    }

    fn migrator(store: MockDocumentStore, mode: MigrationMode) -> RecordMigrator {
        RecordMigrator::new(Arc::new(store), "pending_users", "verified_users", mode)
    }

    #[tokio::test]
    async fn test_sequential_writes_then_deletes() {
        let mut store = MockDocumentStore::new();
        let mut seq = Sequence::new();
        let after = doc(json!({ "verified": true, "email": "a@b.com" }));
        let pending = after.clone();

        store
            .expect_get()
            .with(eq("pending_users"), eq("u1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| {
                let pending = pending.clone();
                Box::pin(async move { Ok(Some(pending)) })
            });
        store
            .expect_set()
            .withf(|collection, id, write| {
                collection == "verified_users"
                    && id == "u1"
                    && write.fields["activated"] == json!(true)
                    && write.server_timestamps == vec!["approvedAt".to_string()]
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Box::pin(async move {
                    Ok(WriteResult {
                        update_time: Utc::now(),
                    })
                })
            });
        store
            .expect_delete()
            .with(eq("pending_users"), eq("u1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Box::pin(async move { Ok(true) }));

        let outcome = migrator(store, MigrationMode::Sequential)
            .migrate("u1", &after)
            .await
            .unwrap();

        assert!(matches!(outcome, MigrationOutcome::Migrated(_)));
    }

    #[tokio::test]
    async fn test_sequential_write_failure_skips_delete() {
        let mut store = MockDocumentStore::new();
        let after = doc(json!({ "verified": true }));
        let pending = after.clone();

        store.expect_get().times(1).returning(move |_, _| {
            let pending = pending.clone();
            Box::pin(async move { Ok(Some(pending)) })
        });
        store.expect_set().times(1).returning(|_, _, _| {
            Box::pin(async move { Err(RepositoryError::InvalidDocument("boom".to_string())) })
        });
        store.expect_delete().never();

        let result = migrator(store, MigrationMode::Sequential)
            .migrate("u1", &after)
            .await;

        assert!(matches!(result, Err(MigrationError::WriteFailed(_))));
    }

    #[tokio::test]
    async fn test_sequential_missing_pending_record_writes_nothing() {
        let mut store = MockDocumentStore::new();

        store
            .expect_get()
            .times(1)
            .returning(|_, _| Box::pin(async move { Ok(None) }));
        store.expect_set().never();
        store.expect_delete().never();

        let outcome = migrator(store, MigrationMode::Sequential)
            .migrate("u1", &doc(json!({ "verified": true })))
            .await
            .unwrap();

        assert_eq!(outcome, MigrationOutcome::AlreadyMigrated);
    }

    #[tokio::test]
    async fn test_sequential_delete_failure_is_reported() {
        let mut store = MockDocumentStore::new();
        let after = doc(json!({ "verified": true }));
        let pending = after.clone();

        store.expect_get().returning(move |_, _| {
            let pending = pending.clone();
            Box::pin(async move { Ok(Some(pending)) })
        });
        store.expect_set().times(1).returning(|_, _, _| {
            Box::pin(async move {
                Ok(WriteResult {
                    update_time: Utc::now(),
                })
            })
        });
        store.expect_delete().times(1).returning(|_, _| {
            Box::pin(async move { Err(RepositoryError::InvalidDocument("locked".to_string())) })
        });

        let result = migrator(store, MigrationMode::Sequential)
            .migrate("u1", &after)
            .await;

        assert!(matches!(result, Err(MigrationError::DeleteFailed(_))));
    }

    #[tokio::test]
    async fn test_transactional_uses_single_move() {
        let mut store = MockDocumentStore::new();

        store.expect_get().never();
        store.expect_set().never();
        store.expect_delete().never();
        store
            .expect_move_document()
            .withf(|from, to, id, write| {
                from == "pending_users"
                    && to == "verified_users"
                    && id == "u1"
                    && write.fields["verified"] == json!(true)
            })
            .times(1)
            .returning(|_, _, _, _| Box::pin(async move { Ok(None) }));

        let outcome = migrator(store, MigrationMode::Transactional)
            .migrate("u1", &doc(json!({ "verified": true })))
            .await
            .unwrap();

        assert_eq!(outcome, MigrationOutcome::AlreadyMigrated);
    }
}
