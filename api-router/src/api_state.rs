use std::sync::Arc;

use common::{
    compression::CompressionService,
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::AppConfig,
};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub storage: StorageManager,
    pub compression: CompressionService,
}

impl ApiState {
    pub async fn new(
        config: &AppConfig,
        storage: StorageManager,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let surreal_db_client = Arc::new(
            SurrealDbClient::new(
                &config.surrealdb_address,
                &config.surrealdb_username,
                &config.surrealdb_password,
                &config.surrealdb_namespace,
                &config.surrealdb_database,
            )
            .await?,
        );

        surreal_db_client.ensure_initialized().await?;

        Ok(Self::with_resources(surreal_db_client, config.clone(), storage))
    }

    pub fn with_resources(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        storage: StorageManager,
    ) -> Self {
        let compression = CompressionService::new(Arc::clone(&db), storage.clone(), config.clone());

        Self {
            db,
            config,
            storage,
            compression,
        }
    }
}
