use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use user_activator::{config::ActivatorConfig, error, AppContext};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "user_activator=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ActivatorConfig::from_env()?;
    tracing::info!(
        "Starting user activator (pending: {}, verified: {}, mode: {:?})",
        config.pending_collection,
        config.verified_collection,
        config.migration_mode
    );

    let context = AppContext::init(config).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl-C");
                signal_token.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let stats = context.listener().run(shutdown).await?;

    tracing::info!(
        "Stopped: {} received, {} ignored, {} completed, {} failed, acknowledged up to {:?}",
        stats.received,
        stats.ignored,
        stats.completed,
        stats.failed,
        stats.acknowledged
    );
    if !stats.aborted.is_empty() {
        tracing::warn!("Positions {:?} will be redelivered on restart", stats.aborted);
    }

    Ok(())
}
