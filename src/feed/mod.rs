//! Change feed capability and the listener that drives activations from it.
//!
//! A feed delivers every update to documents in a namespace, at least once and
//! in increasing `seq` order. Consumers acknowledge the highest `seq` below
//! which everything has been handled; after a restart delivery resumes from
//! there, so unacknowledged events are seen again.

pub mod listener;
pub mod sqlite;

use crate::models::ChangeEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use listener::{AckTracker, ChangeListener, ListenerStats};
pub use sqlite::SqliteChangeFeed;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start delivering update events for `namespace` (a collection name).
    ///
    /// The stream ends when the receiver is dropped.
    async fn subscribe(&self, namespace: &str) -> Result<mpsc::Receiver<ChangeEvent>, FeedError>;

    /// Record that every event of `namespace` up to and including `seq` is handled.
    async fn acknowledge(&self, namespace: &str, seq: i64) -> Result<(), FeedError>;
}
