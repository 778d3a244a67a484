use super::{ChangeFeed, FeedError};
use crate::models::{ChangeEvent, Document};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

const CHANNEL_CAPACITY: usize = 256;

/// Change feed backed by the `document_changes` log that the documents
/// update trigger maintains. Polls for rows past the consumer's cursor.
#[derive(Clone)]
pub struct SqliteChangeFeed {
    pool: SqlitePool,
    consumer: String,
    poll_interval: Duration,
    batch_size: i64,
}

impl SqliteChangeFeed {
    pub fn new(
        pool: SqlitePool,
        consumer: impl Into<String>,
        poll_interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            pool,
            consumer: consumer.into(),
            poll_interval,
            batch_size,
        }
    }

    /// Last acknowledged position for `namespace`, 0 if none.
    pub async fn cursor(&self, namespace: &str) -> Result<i64, FeedError> {
        let row =
            sqlx::query("SELECT last_seq FROM feed_cursors WHERE consumer = ? AND namespace = ?")
                .bind(&self.consumer)
                .bind(namespace)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            Some(row) => row.try_get("last_seq")?,
            None => 0,
        })
    }

    /// Registers this consumer so the log is kept for it until it acknowledges.
    async fn register(&self, namespace: &str) -> Result<(), FeedError> {
        sqlx::query(
            r#"
            INSERT INTO feed_cursors (consumer, namespace, last_seq, updated_at)
            VALUES (?, ?, 0, CURRENT_TIMESTAMP)
            ON CONFLICT (consumer, namespace) DO NOTHING
            "#,
        )
        .bind(&self.consumer)
        .bind(namespace)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes log rows every consumer of their namespace has acknowledged,
    /// plus rows up to `seq` in namespaces nobody follows.
    async fn prune(&self, namespace: &str, seq: i64) -> Result<u64, FeedError> {
        let followed = sqlx::query(
            r#"
            DELETE FROM document_changes
            WHERE collection = ?
              AND seq <= (SELECT MIN(last_seq) FROM feed_cursors WHERE namespace = ?)
            "#,
        )
        .bind(namespace)
        .bind(namespace)
        .execute(&self.pool)
        .await?;

        let unfollowed = sqlx::query(
            r#"
            DELETE FROM document_changes
            WHERE seq <= ?
              AND collection NOT IN (SELECT namespace FROM feed_cursors)
            "#,
        )
        .bind(seq)
        .execute(&self.pool)
        .await?;

        Ok(followed.rows_affected() + unfollowed.rows_affected())
    }

    /// Number of change-log rows retained for `namespace`.
    pub async fn retained(&self, namespace: &str) -> Result<i64, FeedError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM document_changes WHERE collection = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("count")?)
    }
}

async fn fetch_changes(
    pool: &SqlitePool,
    namespace: &str,
    after_seq: i64,
    limit: i64,
) -> Result<Vec<ChangeEvent>, FeedError> {
    let rows = sqlx::query(
        r#"
        SELECT seq, document_id, before_data, after_data
        FROM document_changes
        WHERE collection = ? AND seq > ?
        ORDER BY seq ASC
        LIMIT ?
        "#,
    )
    .bind(namespace)
    .bind(after_seq)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<ChangeEvent, FeedError> {
            let seq: i64 = row.try_get("seq")?;
            let before: Option<String> = row.try_get("before_data")?;
            let after: Option<String> = row.try_get("after_data")?;
            Ok(ChangeEvent {
                seq,
                namespace: namespace.to_string(),
                document_id: row.try_get("document_id")?,
                before: before.as_deref().and_then(|raw| snapshot(seq, raw)),
                after: after.as_deref().and_then(|raw| snapshot(seq, raw)),
            })
        })
        .collect()
}

/// Unreadable snapshots are delivered as absent.
fn snapshot(seq: i64, raw: &str) -> Option<Document> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            tracing::warn!(seq, "Change log entry holds a malformed snapshot");
            None
        }
    }
}

#[async_trait]
impl ChangeFeed for SqliteChangeFeed {
    async fn subscribe(&self, namespace: &str) -> Result<mpsc::Receiver<ChangeEvent>, FeedError> {
        self.register(namespace).await?;
        let mut cursor = self.cursor(namespace).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let pool = self.pool.clone();
        let namespace = namespace.to_string();
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;

        tracing::info!(
            "Subscribed to {} changes from seq {} (poll every {:?})",
            namespace,
            cursor,
            poll_interval
        );

        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let events = match fetch_changes(&pool, &namespace, cursor, batch_size).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("Failed to poll {} changes: {}", namespace, e);
                        continue;
                    }
                };

                if !events.is_empty() {
                    tracing::debug!("Fetched {} {} change(s)", events.len(), namespace);
                }

                for event in events {
                    let seq = event.seq;
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Change feed receiver dropped; stopping poller");
                        return;
                    }
                    cursor = seq;
                }
            }
        });

        Ok(rx)
    }

    async fn acknowledge(&self, namespace: &str, seq: i64) -> Result<(), FeedError> {
        sqlx::query(
            r#"
            INSERT INTO feed_cursors (consumer, namespace, last_seq, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (consumer, namespace) DO UPDATE SET
                last_seq = MAX(feed_cursors.last_seq, excluded.last_seq),
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&self.consumer)
        .bind(namespace)
        .bind(seq)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Acknowledged {} changes up to seq {}", namespace, seq);

        match self.prune(namespace, seq).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!("Pruned {} change log row(s)", pruned),
            Err(e) => tracing::warn!("Failed to prune change log: {}", e),
        }
        Ok(())
    }
}
