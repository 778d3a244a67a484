pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod models;
pub mod repositories;
pub mod services;

// Make test_utils available for both unit tests and integration tests
pub mod test_utils;

use config::ActivatorConfig;
use feed::{ChangeFeed, ChangeListener, SqliteChangeFeed};
use repositories::{DocumentStore, SqliteDocumentStore};
use services::{ActivationService, EmailService, RecordMigrator};
use std::sync::Arc;

/// Process-scoped state shared by every activation.
///
/// Built once at start-up and handed out by `Arc`; nothing in it is torn down
/// explicitly, the pool closes when the last handle is dropped.
#[derive(Clone)]
pub struct AppContext {
    pub config: ActivatorConfig,
    pub pool: sqlx::SqlitePool,
    pub store: Arc<dyn DocumentStore>,
    pub email_service: Arc<dyn EmailService>,
    pub activation_service: Arc<ActivationService>,
    pub change_feed: Arc<dyn ChangeFeed>,
}

impl AppContext {
    /// Connect to the store, apply migrations and choose the mail transport.
    pub async fn init(config: ActivatorConfig) -> error::Result<Self> {
        let pool = db::create_pool(&config.database_url).await?;
        db::run_migrations(&pool).await?;

        let email_service = services::create_email_service(&config);
        Ok(Self::from_parts(config, pool, email_service))
    }

    /// Assemble a context around an existing pool and mail transport.
    pub fn from_parts(
        config: ActivatorConfig,
        pool: sqlx::SqlitePool,
        email_service: Arc<dyn EmailService>,
    ) -> Self {
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(pool.clone()));

        let migrator = RecordMigrator::new(
            store.clone(),
            config.pending_collection.clone(),
            config.verified_collection.clone(),
            config.migration_mode,
        );
        let activation_service = Arc::new(ActivationService::new(migrator, email_service.clone()));

        let change_feed: Arc<dyn ChangeFeed> = Arc::new(SqliteChangeFeed::new(
            pool.clone(),
            config.consumer.clone(),
            config.poll_interval,
            config.batch_size,
        ));

        Self {
            config,
            pool,
            store,
            email_service,
            activation_service,
            change_feed,
        }
    }

    /// Listener over the pending collection.
    pub fn listener(&self) -> ChangeListener {
        ChangeListener::new(
            self.change_feed.clone(),
            self.activation_service.clone(),
            self.config.pending_collection.clone(),
        )
    }
}
