use std::{path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            compression_job::CompressionJob,
            compression_task::{CompressionTask, KEEP_DEAD_LETTER_TASKS, KEEP_SUCCEEDED_TASKS},
        },
    },
};
use tracing::{debug, error, info, warn};

use crate::pipeline::compressed_output_path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_jobs: usize,
    pub artifacts_removed: usize,
    pub tasks_pruned: usize,
}

async fn remove_local(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to remove local file");
            false
        }
    }
}

/// Deletes every job past its expiry together with its files, then trims the
/// finished task history.
#[tracing::instrument(skip_all, fields(now = %now))]
pub async fn run_expiry_sweep(
    db: &SurrealDbClient,
    storage: &StorageManager,
    now: DateTime<Utc>,
) -> Result<SweepReport, AppError> {
    let expired = CompressionJob::find_expired(now, db).await?;
    let mut report = SweepReport {
        expired_jobs: expired.len(),
        ..SweepReport::default()
    };

    let mut ids = Vec::with_capacity(expired.len());
    for job in expired {
        if let Some(locator) = job.output_path.as_deref() {
            match storage.delete(locator).await {
                Ok(()) => report.artifacts_removed += 1,
                Err(err) => {
                    warn!(job_id = %job.id, %locator, error = %err, "failed to delete artifact");
                }
            }
        }

        let input = Path::new(&job.storage_path);
        remove_local(input).await;
        if storage.is_remote() || job.output_path.is_none() {
            remove_local(&compressed_output_path(input)).await;
        }

        ids.push(job.id);
    }

    CompressionJob::delete_many(ids, db).await?;
    report.tasks_pruned =
        CompressionTask::prune_finished(db, KEEP_SUCCEEDED_TASKS, KEEP_DEAD_LETTER_TASKS).await?;

    if report.expired_jobs > 0 || report.tasks_pruned > 0 {
        info!(
            expired_jobs = report.expired_jobs,
            artifacts_removed = report.artifacts_removed,
            tasks_pruned = report.tasks_pruned,
            "expiry sweep finished"
        );
    } else {
        debug!("expiry sweep found nothing to remove");
    }

    Ok(report)
}

pub async fn run_sweeper_loop(
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    interval: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(err) = run_expiry_sweep(&db, &storage, Utc::now()).await {
            error!(error = %err, "expiry sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use common::{
        compression::{CompressionService, UploadedFile},
        storage::types::compression_job::JobDraft,
        utils::config::{AppConfig, StorageKind},
    };
    use std::io::Write;
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    async fn service(data_dir: &Path) -> CompressionService {
        let config = AppConfig {
            data_dir: data_dir.to_string_lossy().into_owned(),
            storage: StorageKind::Local,
            ..Default::default()
        };
        let db = SurrealDbClient::memory("sweeper_test", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("indexes");
        let storage = StorageManager::new(&config).await.expect("storage");
        CompressionService::new(Arc::new(db), storage, config)
    }

    async fn submit(service: &CompressionService, name: &str) -> CompressionJob {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"0123456789").expect("write");
        service
            .submit(
                UploadedFile {
                    file,
                    file_name: name.into(),
                    content_type: Some("image/png".into()),
                },
                75,
                None,
            )
            .await
            .expect("submit")
    }

    #[tokio::test]
    async fn expired_jobs_are_removed_with_their_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;
        let db = service.db();

        let input = dir.path().join("uploads").join("old.png");
        std::fs::create_dir_all(dir.path().join("uploads")).expect("uploads dir");
        std::fs::write(&input, b"0123456789").expect("write upload");
        let output = compressed_output_path(&input);
        std::fs::write(&output, b"01234").expect("write artifact");

        let expired = CompressionJob::create_and_add_to_db(
            JobDraft {
                batch_id: None,
                user_id: None,
                original_name: "old.png".into(),
                original_size: 10,
                mime_type: "image/png".into(),
                quality: 75,
                storage_path: input.to_string_lossy().into_owned(),
            },
            ChronoDuration::hours(-1),
            db,
        )
        .await
        .expect("job");
        expired
            .mark_processing(db)
            .await
            .expect("processing")
            .mark_done(output.to_string_lossy().into_owned(), 5, db)
            .await
            .expect("done");

        let fresh = submit(&service, "fresh.png").await;

        let report = run_expiry_sweep(db, service.storage(), Utc::now())
            .await
            .expect("sweep");
        assert_eq!(report.expired_jobs, 1);
        assert_eq!(report.artifacts_removed, 1);

        assert!(matches!(
            service.get_status(&expired.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(!output.exists());
        assert!(!input.exists());

        assert!(service.get_status(&fresh.id).await.is_ok());
        assert!(Path::new(&fresh.storage_path).exists());

        let again = run_expiry_sweep(db, service.storage(), Utc::now())
            .await
            .expect("sweep");
        assert_eq!(again, SweepReport::default());
    }
}
