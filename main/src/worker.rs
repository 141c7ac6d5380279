use std::{sync::Arc, time::Duration};

use common::{
    storage::db::SurrealDbClient, storage::store::StorageManager, utils::config::get_config,
};
use compression_pipeline::{
    pipeline::CompressionPipeline, run_worker_pool, sweeper::run_sweeper_loop,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let storage = StorageManager::new(&config).await?;

    let compression_pipeline = Arc::new(CompressionPipeline::new(db.clone(), storage.clone()));

    info!(
        concurrency = config.worker_concurrency,
        sweep_interval_secs = config.sweep_interval_secs,
        "Starting worker process"
    );

    tokio::select! {
        result = run_worker_pool(db.clone(), compression_pipeline, config.worker_concurrency) => result?,
        result = run_sweeper_loop(db, storage, Duration::from_secs(config.sweep_interval_secs)) => result?,
    }

    Ok(())
}
