use std::path::PathBuf;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{compression_job::CompressionJob, compression_task::CompressionTask},
    },
};
use tracing::error;

use super::services::CompressionEngine;

pub struct PipelineContext<'a> {
    pub task: &'a CompressionTask,
    pub task_id: String,
    pub job_id: String,
    pub attempt: u32,
    pub db: &'a SurrealDbClient,
    pub storage: &'a StorageManager,
    pub engine: &'a dyn CompressionEngine,
    pub job: CompressionJob,
    pub local_output: Option<PathBuf>,
    pub compressed_size: Option<u64>,
    pub locator: Option<String>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        task: &'a CompressionTask,
        job: CompressionJob,
        db: &'a SurrealDbClient,
        storage: &'a StorageManager,
        engine: &'a dyn CompressionEngine,
    ) -> Self {
        Self {
            task,
            task_id: task.id.clone(),
            job_id: job.id.clone(),
            attempt: task.attempts,
            db,
            storage,
            engine,
            job,
            local_output: None,
            compressed_size: None,
            locator: None,
        }
    }

    pub fn local_output(&self) -> Result<&PathBuf, AppError> {
        self.local_output
            .as_ref()
            .ok_or_else(|| AppError::InternalError("compressed output expected on disk".into()))
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            task_id = %self.task_id,
            job_id = %self.job_id,
            attempt = self.attempt,
            error = %err,
            "compression pipeline aborted"
        );
        err
    }
}
