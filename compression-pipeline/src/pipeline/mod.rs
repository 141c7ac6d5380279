mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::{PipelineConfig, PipelineTuning};
pub use services::{CompressionEngine, ImageEngine};
pub use stages::compressed_output_path;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            compression_job::CompressionJob,
            compression_task::{CompressionTask, TaskErrorInfo},
        },
    },
};
use tracing::{debug, info, warn};

use self::{
    context::PipelineContext,
    stages::{complete, compress, start, store},
    state::ready,
};

#[allow(clippy::module_name_repetitions)]
pub struct CompressionPipeline {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    pipeline_config: PipelineConfig,
    engine: Arc<dyn CompressionEngine>,
}

impl CompressionPipeline {
    pub fn new(db: Arc<SurrealDbClient>, storage: StorageManager) -> Self {
        Self::with_engine(db, storage, PipelineConfig::default(), Arc::new(ImageEngine))
    }

    pub fn with_engine(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        pipeline_config: PipelineConfig,
        engine: Arc<dyn CompressionEngine>,
    ) -> Self {
        Self {
            db,
            storage,
            pipeline_config,
            engine,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(
            task_id = %task.id,
            job_id = %task.payload.job_id,
            attempt = task.attempts,
            worker_id = task.worker_id.as_deref().unwrap_or("unknown-worker")
        )
    )]
    pub async fn process_task(&self, task: CompressionTask) -> Result<(), AppError> {
        let processing_task = task.mark_processing(&self.db).await?;

        // A redelivered task whose job already settled, or was swept, has nothing left to do.
        let job = match CompressionJob::get(&processing_task.payload.job_id, &self.db).await {
            Ok(job) if job.status.is_terminal() => {
                debug!(
                    task_id = %processing_task.id,
                    job_id = %job.id,
                    status = job.status.as_str(),
                    "job already settled; acknowledging task"
                );
                processing_task.mark_succeeded(&self.db).await?;
                return Ok(());
            }
            Ok(job) => job,
            Err(AppError::NotFound(_)) => {
                debug!(
                    task_id = %processing_task.id,
                    job_id = %processing_task.payload.job_id,
                    "job no longer exists; acknowledging task"
                );
                processing_task.mark_succeeded(&self.db).await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match self.drive_pipeline(&processing_task, job.clone()).await {
            Ok(()) => {
                processing_task.mark_succeeded(&self.db).await?;
                info!(
                    task_id = %processing_task.id,
                    job_id = %job.id,
                    attempt = processing_task.attempts,
                    "compression task succeeded"
                );
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                let error_info = TaskErrorInfo {
                    code: Some(err.code().to_string()),
                    message: reason.clone(),
                };

                if err.is_retryable() && processing_task.can_retry() {
                    let delay = self.retry_delay(processing_task.attempts);
                    processing_task
                        .mark_failed(error_info, delay, &self.db)
                        .await?;
                    warn!(
                        task_id = %processing_task.id,
                        job_id = %job.id,
                        attempt = processing_task.attempts,
                        retry_in_secs = delay.as_secs(),
                        "compression task failed; scheduled retry"
                    );
                } else {
                    let failed_task = processing_task
                        .mark_failed(error_info.clone(), Duration::from_secs(0), &self.db)
                        .await?;
                    failed_task.mark_dead_letter(error_info, &self.db).await?;

                    let current = CompressionJob::get(&job.id, &self.db).await?;
                    current.mark_failed(&reason, &self.db).await?;
                    warn!(
                        task_id = %failed_task.id,
                        job_id = %job.id,
                        attempt = failed_task.attempts,
                        "compression task failed; moved to dead letter queue"
                    );
                }

                Err(AppError::Processing(reason))
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let tuning = &self.pipeline_config.tuning;
        let capped_attempt = attempt
            .saturating_sub(1)
            .min(tuning.retry_backoff_cap_exponent);
        let multiplier = 2_u64.pow(capped_attempt);
        let delay = tuning.retry_base_delay_secs.saturating_mul(multiplier);

        Duration::from_secs(delay.min(tuning.retry_max_delay_secs))
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    #[tracing::instrument(skip_all, fields(task_id = %task.id, attempt = task.attempts))]
    async fn drive_pipeline(
        &self,
        task: &CompressionTask,
        job: CompressionJob,
    ) -> Result<(), AppError> {
        let mut ctx = PipelineContext::new(
            task,
            job,
            self.db.as_ref(),
            &self.storage,
            self.engine.as_ref(),
        );

        let machine = ready();
        let pipeline_started = Instant::now();

        let machine = start(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;

        let stage_start = Instant::now();
        let machine = compress(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let compress_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = store(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let store_duration = stage_start.elapsed();

        let _machine = complete(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;

        info!(
            task_id = %ctx.task_id,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            compress_ms = Self::duration_millis(compress_duration),
            store_ms = Self::duration_millis(store_duration),
            "compression pipeline finished"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests;
