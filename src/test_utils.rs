pub mod test_helpers {
    use crate::config::ActivatorConfig;
    use crate::models::{ChangeEvent, Document, DocumentWrite, WriteResult};
    use crate::repositories::{
        DocumentStore, RepositoryError, RepositoryResult, StoredDocument,
    };
    use crate::services::email_service::{ApprovalEmail, EmailError, EmailService};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::sync::Mutex;

    /// Create a new in-memory SQLite database for testing
    pub async fn create_test_db() -> Result<SqlitePool, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(pool)
    }

    /// Create a temporary file-based SQLite database for testing
    /// Useful when several connections must see the same data
    pub async fn create_test_db_file() -> Result<(SqlitePool, NamedTempFile), sqlx::Error> {
        let temp_file = NamedTempFile::new().map_err(sqlx::Error::Io)?;
        let db_path = temp_file
            .path()
            .to_str()
            .ok_or_else(|| sqlx::Error::Configuration("Invalid database path".into()))?;
        let database_url = format!("sqlite://{}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok((pool, temp_file))
    }

    /// Config pointing at the default collections, with a fast poll interval.
    pub fn test_config() -> ActivatorConfig {
        ActivatorConfig {
            database_url: "sqlite::memory:".to_string(),
            poll_interval: Duration::from_millis(10),
            ..ActivatorConfig::default()
        }
    }

    pub fn document(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected a JSON object, got {}", other),
        }
    }

    /// Insert an unverified record into `pending_users`.
    pub async fn insert_pending_user(
        store: &dyn DocumentStore,
        id: &str,
        email: &str,
        name: Option<&str>,
    ) -> RepositoryResult<WriteResult> {
        let mut fields = document(json!({ "email": email, "verified": false }));
        if let Some(name) = name {
            fields.insert("name".to_string(), json!(name));
        }
        store
            .create("pending_users", id, DocumentWrite::new(fields))
            .await
    }

    /// The event a feed would deliver when `id` flips from unverified to verified.
    pub fn verification_event(seq: i64, id: &str, after: Value) -> ChangeEvent {
        ChangeEvent {
            seq,
            namespace: "pending_users".to_string(),
            document_id: id.to_string(),
            before: Some(document(json!({ "verified": false }))),
            after: Some(document(after)),
        }
    }

    /// Email service that keeps every message it is asked to send.
    #[derive(Default)]
    pub struct RecordingEmailService {
        sent: Mutex<Vec<ApprovalEmail>>,
        fail: AtomicBool,
        attempts: AtomicUsize,
    }

    impl RecordingEmailService {
        pub fn new() -> Self {
            Self::default()
        }

        /// A service whose every send fails after being recorded as an attempt.
        pub fn failing() -> Self {
            let service = Self::default();
            service.fail.store(true, Ordering::SeqCst);
            service
        }

        pub async fn sent(&self) -> Vec<ApprovalEmail> {
            self.sent.lock().await.clone()
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmailService for RecordingEmailService {
        async fn send_approval_email(
            &self,
            to_email: &str,
            recipient_name: &str,
        ) -> Result<(), EmailError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmailError::SendFailed(
                    "535 Authentication rejected".to_string(),
                ));
            }

            let email = ApprovalEmail::new(
                "ShieldUp Team",
                "team@shieldup.test",
                to_email,
                recipient_name,
            )?;
            self.sent.lock().await.push(email);
            Ok(())
        }
    }

    /// Wraps a store, counts writes and deletes, and can be told to fail them.
    ///
    /// A `move_document` counts as one write plus one delete when it moved
    /// something; an injected failure counts as one attempted write.
    pub struct FaultyStore {
        inner: Arc<dyn DocumentStore>,
        pub fail_set: AtomicBool,
        pub fail_delete: AtomicBool,
        pub sets: AtomicUsize,
        pub deletes: AtomicUsize,
    }

    impl FaultyStore {
        pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
            Self {
                inner,
                fail_set: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
                sets: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            }
        }

        fn injected(step: &str) -> RepositoryError {
            RepositoryError::Database(sqlx::Error::Protocol(format!(
                "injected {} failure",
                step
            )))
        }
    }

    #[async_trait]
    impl DocumentStore for FaultyStore {
        async fn get(&self, collection: &str, id: &str) -> RepositoryResult<Option<Document>> {
            self.inner.get(collection, id).await
        }

        async fn set(
            &self,
            collection: &str,
            id: &str,
            write: DocumentWrite,
        ) -> RepositoryResult<WriteResult> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if self.fail_set.load(Ordering::SeqCst) {
                return Err(Self::injected("set"));
            }
            self.inner.set(collection, id, write).await
        }

        async fn create(
            &self,
            collection: &str,
            id: &str,
            write: DocumentWrite,
        ) -> RepositoryResult<WriteResult> {
            self.inner.create(collection, id, write).await
        }

        async fn update(
            &self,
            collection: &str,
            id: &str,
            fields: Document,
        ) -> RepositoryResult<WriteResult> {
            self.inner.update(collection, id, fields).await
        }

        async fn delete(&self, collection: &str, id: &str) -> RepositoryResult<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(Self::injected("delete"));
            }
            self.inner.delete(collection, id).await
        }

        async fn list(
            &self,
            collection: &str,
            limit: Option<i64>,
            offset: Option<i64>,
        ) -> RepositoryResult<Vec<StoredDocument>> {
            self.inner.list(collection, limit, offset).await
        }

        async fn move_document(
            &self,
            from: &str,
            to: &str,
            id: &str,
            write: DocumentWrite,
        ) -> RepositoryResult<Option<WriteResult>> {
            if self.fail_set.load(Ordering::SeqCst) {
                self.sets.fetch_add(1, Ordering::SeqCst);
                return Err(Self::injected("move"));
            }
            let moved = self.inner.move_document(from, to, id, write).await?;
            if moved.is_some() {
                self.sets.fetch_add(1, Ordering::SeqCst);
                self.deletes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(moved)
        }
    }
}
