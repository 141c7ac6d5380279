use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    compression::API_PREFIX,
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::get_config,
};
use compression_pipeline::{
    pipeline::CompressionPipeline, run_worker_pool, sweeper::run_sweeper_loop,
};
use std::{future::IntoFuture, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
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

    // Ensure db is initialized
    db.ensure_initialized().await?;

    // Create global storage manager
    let storage = StorageManager::new(&config).await?;

    let api_state = ApiState::with_resources(db.clone(), config.clone(), storage.clone());
    let app = build_app(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    let compression_pipeline = Arc::new(CompressionPipeline::new(db.clone(), storage.clone()));
    info!(
        concurrency = config.worker_concurrency,
        "Starting worker pool alongside the server"
    );

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        result = run_worker_pool(db.clone(), compression_pipeline, config.worker_concurrency) => {
            if let Err(e) = result {
                error!("Worker pool error: {}", e);
            }
        }
        result = run_sweeper_loop(db, storage, Duration::from_secs(config.sweep_interval_secs)) => {
            if let Err(e) = result {
                error!("Sweeper error: {}", e);
            }
        }
    }

    Ok(())
}

fn build_app(api_state: ApiState) -> Router {
    Router::new()
        .nest(API_PREFIX, api_routes_v1(&api_state))
        .with_state(api_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use common::utils::config::{AppConfig, StorageKind};
    use compression_pipeline::sweeper::run_expiry_sweep;
    use std::path::Path;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn smoke_test_config(namespace: &str, database: &str, data_dir: &Path) -> AppConfig {
        AppConfig {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: namespace.into(),
            surrealdb_database: database.into(),
            data_dir: data_dir.to_string_lossy().into_owned(),
            http_port: 0,
            storage: StorageKind::Local,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let namespace = "test_ns";
        let database = format!("test_db_{}", Uuid::new_v4());
        let data_dir = std::env::temp_dir().join(format!("compressor_smoke_{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&data_dir)
            .await
            .expect("failed to create temp data directory");

        let config = smoke_test_config(namespace, &database, &data_dir);
        let db = Arc::new(
            SurrealDbClient::memory(namespace, &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );
        db.ensure_initialized()
            .await
            .expect("failed to build indexes");

        let storage = StorageManager::new(&config)
            .await
            .expect("failed to build storage manager");

        let app = build_app(ApiState::with_resources(
            db.clone(),
            config.clone(),
            storage.clone(),
        ));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/live")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);

        let ready_response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("ready response");
        assert_eq!(ready_response.status(), StatusCode::OK);

        let report = run_expiry_sweep(&db, &storage, chrono::Utc::now())
            .await
            .expect("sweep on empty store");
        assert_eq!(report.expired_jobs, 0);

        tokio::fs::remove_dir_all(&data_dir).await.ok();
    }
}
