#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod sweeper;
pub mod utils;

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::compression_task::{CompressionTask, DEFAULT_LEASE_SECS},
    },
};
pub use pipeline::{CompressionEngine, CompressionPipeline, ImageEngine, PipelineConfig, PipelineTuning};
use std::sync::Arc;
use tokio::{
    task::JoinSet,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};
use uuid::Uuid;

pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    compression_pipeline: Arc<CompressionPipeline>,
    worker_id: String,
) -> Result<(), AppError> {
    let lease_duration = Duration::from_secs(u64::try_from(DEFAULT_LEASE_SECS).unwrap_or(300));
    let idle_backoff = Duration::from_millis(500);

    loop {
        match CompressionTask::claim_next_ready(&db, &worker_id, Utc::now(), lease_duration).await
        {
            Ok(Some(task)) => {
                let task_id = task.id.clone();
                info!(
                    %worker_id,
                    %task_id,
                    job_id = %task.payload.job_id,
                    attempt = task.attempts,
                    "claimed compression task"
                );
                if let Err(err) = compression_pipeline.process_task(task).await {
                    error!(%worker_id, %task_id, error = %err, "compression task failed");
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim compression task");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Runs `concurrency` claim loops against the shared queue.
pub async fn run_worker_pool(
    db: Arc<SurrealDbClient>,
    compression_pipeline: Arc<CompressionPipeline>,
    concurrency: usize,
) -> Result<(), AppError> {
    let mut workers = JoinSet::new();
    for _ in 0..concurrency.max(1) {
        let worker_id = format!("compression-worker-{}", Uuid::new_v4());
        workers.spawn(run_worker_loop(
            Arc::clone(&db),
            Arc::clone(&compression_pipeline),
            worker_id,
        ));
    }
    info!(concurrency = workers.len(), "compression worker pool started");

    while let Some(joined) = workers.join_next().await {
        joined??;
    }

    Ok(())
}
