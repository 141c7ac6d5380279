use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    BatchEntry, BatchSubmission, EntryStatus, HistoryPage, JobView, OutputFile, UploadedFile,
    UsageReport, DEFAULT_PAGE_SIZE,
};
use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::{resolve_base_dir, StorageManager, UPLOADS_DIR},
        types::{
            compression_job::{CompressionJob, JobDraft, JobStatus, MAX_PAGE_SIZE},
            compression_task::{CompressionTask, TaskPayload},
            user::User,
        },
    },
    utils::{
        archive::{build_zip, unique_entry_name, ArchiveEntry},
        config::AppConfig,
        upload_limits::{resolve_mime_type, validate_batch_size, validate_upload},
    },
};

/// Submission and read side of the compression job lifecycle.
#[derive(Clone)]
pub struct CompressionService {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    config: AppConfig,
}

impl CompressionService {
    pub fn new(db: Arc<SurrealDbClient>, storage: StorageManager, config: AppConfig) -> Self {
        Self {
            db,
            storage,
            config,
        }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Validates an upload, takes quota, and queues a compression job for it.
    #[tracing::instrument(skip_all, fields(file_name = %upload.file_name, quality = quality))]
    pub async fn submit(
        &self,
        upload: UploadedFile,
        quality: u8,
        user: Option<&User>,
    ) -> Result<CompressionJob, AppError> {
        self.submit_one(upload, quality, user, None).await
    }

    /// Submits every file under one batch id. A rejected file does not affect its siblings.
    #[tracing::instrument(skip_all, fields(files = uploads.len(), quality = quality))]
    pub async fn submit_batch(
        &self,
        uploads: Vec<UploadedFile>,
        quality: u8,
        user: Option<&User>,
    ) -> Result<BatchSubmission, AppError> {
        validate_batch_size(&self.config, uploads.len())?;

        let batch_id = Uuid::new_v4().to_string();
        let mut jobs = Vec::with_capacity(uploads.len());

        for upload in uploads {
            let original_name = upload.file_name.clone();
            match self
                .submit_one(upload, quality, user, Some(batch_id.clone()))
                .await
            {
                Ok(job) => jobs.push(BatchEntry {
                    job_id: Some(job.id),
                    original_name,
                    status: EntryStatus::Pending,
                    error: None,
                    code: None,
                }),
                Err(err) => {
                    warn!(%batch_id, file_name = %original_name, error = %err, "batch file rejected");
                    jobs.push(BatchEntry {
                        job_id: None,
                        original_name,
                        status: EntryStatus::Rejected,
                        code: Some(err.code()),
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        Ok(BatchSubmission { batch_id, jobs })
    }

    async fn submit_one(
        &self,
        upload: UploadedFile,
        quality: u8,
        user: Option<&User>,
        batch_id: Option<String>,
    ) -> Result<CompressionJob, AppError> {
        let UploadedFile {
            file,
            file_name,
            content_type,
        } = upload;

        let mime_type = resolve_mime_type(content_type.as_deref(), &file_name);
        let size = file.as_file().metadata()?.len();
        validate_upload(&self.config, &mime_type, size)?;

        let now = Utc::now();
        if let Some(user) = user {
            user.consume_daily_quota(now, &self.db).await?;
        }

        let queued = async {
            let extension = upload_extension(&file_name, &mime_type);
            let storage_path = self.persist_upload(file, &extension).await?;

            let job = match CompressionJob::create_and_add_to_db(
                JobDraft {
                    batch_id,
                    user_id: user.map(|u| u.id.clone()),
                    original_name: file_name,
                    original_size: size,
                    mime_type: mime_type.clone(),
                    quality,
                    storage_path: storage_path.clone(),
                },
                ChronoDuration::hours(self.config.job_ttl_hours),
                &self.db,
            )
            .await
            {
                Ok(job) => job,
                Err(err) => {
                    discard_upload(&storage_path).await;
                    return Err(err);
                }
            };

            // A job row without a task would sit in PENDING until it expires.
            let task = match CompressionTask::create_and_add_to_db(
                TaskPayload {
                    job_id: job.id.clone(),
                    input_path: storage_path.clone(),
                    mime_type,
                    quality: job.quality,
                },
                &self.db,
            )
            .await
            {
                Ok(task) => task,
                Err(err) => {
                    if let Err(delete_err) =
                        CompressionJob::delete_many(vec![job.id.clone()], &self.db).await
                    {
                        warn!(
                            job_id = %job.id,
                            error = %delete_err,
                            "failed to remove unqueued job"
                        );
                    }
                    discard_upload(&storage_path).await;
                    return Err(err);
                }
            };

            info!(job_id = %job.id, task_id = %task.id, size, "compression job queued");
            Ok::<_, AppError>(job)
        }
        .await;

        if let (Err(err), Some(user)) = (&queued, user) {
            if let Err(refund_err) = user.refund_daily_quota(now, &self.db).await {
                warn!(user_id = %user.id, cause = %err, error = %refund_err, "failed to refund quota");
            }
        }

        queued
    }

    async fn persist_upload(&self, file: NamedTempFile, extension: &str) -> Result<String, AppError> {
        let upload_dir = resolve_base_dir(&self.config).join(UPLOADS_DIR);
        tokio::fs::create_dir_all(&upload_dir).await?;

        let final_path: PathBuf = upload_dir.join(format!("{}{extension}", Uuid::new_v4()));
        if let Err(err) = file.persist(&final_path) {
            // The temp dir can sit on another filesystem than data_dir.
            tokio::fs::copy(err.file.path(), &final_path).await?;
        }

        Ok(final_path.to_string_lossy().into_owned())
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobView, AppError> {
        let job = CompressionJob::get(job_id, &self.db).await?;
        Ok(self.view(&job))
    }

    fn view(&self, job: &CompressionJob) -> JobView {
        let mut view = JobView::from(job);
        if job.status == JobStatus::Done {
            view.file_url = job
                .output_path
                .as_deref()
                .map(|locator| self.storage.get_url(locator));
        }
        view
    }

    /// Loads the compressed artifact of a finished job.
    pub async fn fetch_output(&self, job_id: &str) -> Result<OutputFile, AppError> {
        let job = CompressionJob::get(job_id, &self.db).await?;

        let locator = match (&job.status, &job.output_path) {
            (JobStatus::Done, Some(locator)) => locator.clone(),
            _ => return Err(AppError::NotReady(job.id)),
        };

        let data = self
            .storage
            .get_buffer(&locator)
            .await
            .map_err(|err| match err {
                AppError::NotFound(_) => AppError::Expired(job.id.clone()),
                other => other,
            })?;

        Ok(OutputFile {
            data,
            file_name: job.archive_name(),
            mime_type: job.mime_type,
        })
    }

    pub async fn list_history(
        &self,
        user_id: &str,
        page: Option<usize>,
        page_size: Option<usize>,
    ) -> Result<HistoryPage, AppError> {
        let page = page.unwrap_or(1).max(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let (jobs, total) = CompressionJob::list_for_user(user_id, page, page_size, &self.db).await?;
        let size = i64::try_from(page_size).unwrap_or(i64::MAX);

        Ok(HistoryPage {
            items: jobs.iter().map(|job| self.view(job)).collect(),
            total,
            page,
            page_size,
            total_pages: (total + size - 1) / size,
        })
    }

    /// Compressed artifacts of a batch that are still retrievable.
    pub async fn batch_artifacts(&self, batch_id: &str) -> Result<Vec<ArchiveEntry>, AppError> {
        let done: Vec<CompressionJob> = CompressionJob::find_by_batch(batch_id, &self.db)
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Done)
            .collect();

        if done.is_empty() {
            return Err(AppError::BatchNotReady(batch_id.to_string()));
        }

        let mut entries = Vec::with_capacity(done.len());
        let mut taken = HashSet::with_capacity(done.len());
        for job in done {
            let Some(locator) = job.output_path.as_deref() else {
                continue;
            };
            match self.storage.get_buffer(locator).await {
                Ok(data) => entries.push(ArchiveEntry {
                    name: unique_entry_name(&job.archive_name(), &mut taken),
                    data,
                }),
                Err(AppError::NotFound(_)) => {
                    warn!(job_id = %job.id, %batch_id, "artifact missing, left out of archive");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(entries)
    }

    /// ZIP of every retrievable artifact in the batch.
    pub async fn batch_zip(&self, batch_id: &str) -> Result<Vec<u8>, AppError> {
        let entries = self.batch_artifacts(batch_id).await?;
        tokio::task::spawn_blocking(move || build_zip(&entries)).await?
    }

    pub async fn usage(&self, user: &User) -> Result<UsageReport, AppError> {
        let now = Utc::now();
        let totals = CompressionJob::totals_for_user(&user.id, &self.db).await?;
        let tomorrow = (now + ChronoDuration::days(1))
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();

        Ok(UsageReport {
            tier: user.tier.as_str(),
            daily_uploads: user.uploads_today(now),
            daily_limit: user.tier.daily_limit().map_or(-1, i64::from),
            total_jobs: totals.done_jobs,
            total_bytes_saved: totals.bytes_saved,
            reset_at: tomorrow,
        })
    }
}

/// Best-effort removal of an upload that never made it onto the queue.
async fn discard_upload(path: &str) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path, error = %err, "failed to remove unqueued upload");
        }
    }
}

/// Extension for the persisted upload, from the client's file name or the MIME type.
fn upload_extension(file_name: &str, mime_type: &str) -> String {
    let from_name = Path::new(file_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    if let Some(ext) = from_name {
        return format!(".{ext}");
    }

    match mime_type {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/avif" => ".avif",
        _ => "",
    }
    .to_string()
}
