use crate::models::document::{format_timestamp, Document, DocumentWrite, WriteResult};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Document not found")]
    NotFound,
    #[error("Document already exists")]
    AlreadyExists,
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Document,
    pub updated_at: String,
}

#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> RepositoryResult<Option<Document>>;

    /// Full overwrite of `collection/id`, creating it when missing.
    async fn set(
        &self,
        collection: &str,
        id: &str,
        write: DocumentWrite,
    ) -> RepositoryResult<WriteResult>;

    /// Insert a new document; fails with `AlreadyExists` if the id is taken.
    async fn create(
        &self,
        collection: &str,
        id: &str,
        write: DocumentWrite,
    ) -> RepositoryResult<WriteResult>;

    /// Merge `fields` into an existing document.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> RepositoryResult<WriteResult>;

    /// Returns whether a document was removed. Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> RepositoryResult<bool>;

    async fn list(
        &self,
        collection: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> RepositoryResult<Vec<StoredDocument>>;

    /// Atomically write `write` to `to/id` and delete `from/id`, but only if
    /// `from/id` still exists. Returns `None` without writing when it does not.
    async fn move_document(
        &self,
        from: &str,
        to: &str,
        id: &str,
        write: DocumentWrite,
    ) -> RepositoryResult<Option<WriteResult>>;
}

pub struct SqliteDocumentStore {
    pool: SqlitePool,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            last_timestamp: Mutex::new(None),
        }
    }

    /// Server timestamp for the next write: microsecond precision, strictly
    /// increasing for this store instance even if the wall clock stalls.
    async fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().await;
        let mut now = Utc::now().trunc_subsecs(6);
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    /// Read-then-write transactions take the write lock up front. A deferred
    /// transaction that reads first fails with `SQLITE_BUSY` instead of
    /// waiting when another writer got there in between.
    async fn begin_write(&self) -> RepositoryResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

fn parse_document(raw: &str) -> RepositoryResult<Document> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(RepositoryError::InvalidDocument(format!(
            "expected a JSON object, found {}",
            other
        ))),
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> RepositoryResult<Option<Document>> {
        let row = sqlx::query("SELECT data FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("data")?;
                Ok(Some(parse_document(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        write: DocumentWrite,
    ) -> RepositoryResult<WriteResult> {
        let update_time = self.next_timestamp().await;
        let data = serde_json::to_string(&write.resolve(update_time))?;
        let stamp = format_timestamp(update_time);

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(&data)
        .bind(&stamp)
        .execute(&self.pool)
        .await?;

        Ok(WriteResult { update_time })
    }

    async fn create(
        &self,
        collection: &str,
        id: &str,
        write: DocumentWrite,
    ) -> RepositoryResult<WriteResult> {
        let update_time = self.next_timestamp().await;
        let data = serde_json::to_string(&write.resolve(update_time))?;
        let stamp = format_timestamp(update_time);

        let result = sqlx::query(
            "INSERT INTO documents (collection, id, data, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(id)
        .bind(&data)
        .bind(&stamp)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(WriteResult { update_time }),
            Err(e) => {
                if e.to_string().contains("UNIQUE") {
                    Err(RepositoryError::AlreadyExists)
                } else {
                    Err(RepositoryError::Database(e))
                }
            }
        }
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> RepositoryResult<WriteResult> {
        let mut tx = self.begin_write().await?;

        let row = sqlx::query("SELECT data FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        let raw: String = row.try_get("data")?;
        let mut merged = parse_document(&raw)?;
        merged.extend(fields);

        let update_time = self.next_timestamp().await;
        sqlx::query(
            "UPDATE documents SET data = ?, updated_at = ? WHERE collection = ? AND id = ?",
        )
        .bind(serde_json::to_string(&merged)?)
        .bind(format_timestamp(update_time))
        .bind(collection)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(WriteResult { update_time })
    }

    async fn delete(&self, collection: &str, id: &str) -> RepositoryResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        collection: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> RepositoryResult<Vec<StoredDocument>> {
        let limit = limit.unwrap_or(100);
        let offset = offset.unwrap_or(0);

        let rows = sqlx::query(
            r#"
            SELECT id, data, updated_at
            FROM documents
            WHERE collection = ?
            ORDER BY updated_at DESC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(collection)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> RepositoryResult<StoredDocument> {
                let raw: String = row.try_get("data")?;
                Ok(StoredDocument {
                    id: row.try_get("id")?,
                    data: parse_document(&raw)?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn move_document(
        &self,
        from: &str,
        to: &str,
        id: &str,
        write: DocumentWrite,
    ) -> RepositoryResult<Option<WriteResult>> {
        let mut tx = self.begin_write().await?;

        let exists = sqlx::query("SELECT 1 FROM documents WHERE collection = ? AND id = ?")
            .bind(from)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        if !exists {
            tx.rollback().await?;
            return Ok(None);
        }

        let update_time = self.next_timestamp().await;
        let data = serde_json::to_string(&write.resolve(update_time))?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(to)
        .bind(id)
        .bind(&data)
        .bind(format_timestamp(update_time))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(from)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(WriteResult { update_time }))
    }
}
