use std::{
    io::{Cursor, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use common::{
    compression::{CompressionService, UploadedFile},
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            compression_job::{CompressionJob, JobStatus},
            compression_task::{CompressionTask, TaskPayload, TaskState},
        },
    },
    utils::config::{AppConfig, StorageKind},
};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, ImageBuffer, ImageFormat, Rgb};
use object_store::memory::InMemory;
use tempfile::{NamedTempFile, TempDir};
use uuid::Uuid;

use super::{CompressionEngine, CompressionPipeline, ImageEngine, PipelineConfig};

#[derive(Default)]
struct MockEngine {
    calls: AtomicUsize,
}

#[async_trait]
impl CompressionEngine for MockEngine {
    async fn compress(
        &self,
        input: Bytes,
        _mime_type: &str,
        _quality: u8,
    ) -> Result<Vec<u8>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input[..input.len() / 2].to_vec())
    }
}

struct FailingEngine;

#[async_trait]
impl CompressionEngine for FailingEngine {
    async fn compress(
        &self,
        _input: Bytes,
        _mime_type: &str,
        _quality: u8,
    ) -> Result<Vec<u8>, AppError> {
        Err(AppError::Codec("decoder ran out of data".into()))
    }
}

struct ValidationEngine;

#[async_trait]
impl CompressionEngine for ValidationEngine {
    async fn compress(
        &self,
        _input: Bytes,
        _mime_type: &str,
        _quality: u8,
    ) -> Result<Vec<u8>, AppError> {
        Err(AppError::Validation("unsupported color type".into()))
    }
}

struct Harness {
    db: Arc<SurrealDbClient>,
    service: CompressionService,
    _data_dir: TempDir,
}

async fn setup_db() -> SurrealDbClient {
    let namespace = "pipeline_test";
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory(namespace, &database)
        .await
        .expect("Failed to create in-memory SurrealDB");
    db.ensure_initialized()
        .await
        .expect("Failed to build indexes");
    db
}

async fn harness() -> Harness {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig {
        data_dir: data_dir.path().to_string_lossy().into_owned(),
        storage: StorageKind::Local,
        ..Default::default()
    };
    let db = Arc::new(setup_db().await);
    let storage = StorageManager::new(&config).await.expect("local storage");

    Harness {
        service: CompressionService::new(Arc::clone(&db), storage, config),
        db,
        _data_dir: data_dir,
    }
}

impl Harness {
    fn pipeline(&self, engine: Arc<dyn CompressionEngine>) -> CompressionPipeline {
        CompressionPipeline::with_engine(
            Arc::clone(&self.db),
            self.service.storage().clone(),
            PipelineConfig::default(),
            engine,
        )
    }

    async fn submit(&self, name: &str, content_type: &str, bytes: &[u8]) -> CompressionJob {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(bytes).expect("write upload");
        self.service
            .submit(
                UploadedFile {
                    file,
                    file_name: name.to_string(),
                    content_type: Some(content_type.to_string()),
                },
                75,
                None,
            )
            .await
            .expect("submit")
    }

    async fn job(&self, id: &str) -> CompressionJob {
        CompressionJob::get(id, &self.db).await.expect("job present")
    }

    async fn task(&self, id: &str) -> CompressionTask {
        self.db
            .get_item(id)
            .await
            .expect("retrieve task")
            .expect("task present")
    }
}

async fn reserve_task(db: &SurrealDbClient, worker_id: &str) -> CompressionTask {
    reserve_task_at(db, worker_id, Utc::now()).await
}

async fn reserve_task_at(
    db: &SurrealDbClient,
    worker_id: &str,
    now: chrono::DateTime<Utc>,
) -> CompressionTask {
    CompressionTask::claim_next_ready(db, worker_id, now, std::time::Duration::from_secs(300))
        .await
        .expect("claim succeeds")
        .expect("task claimed")
}

fn encoded(width: u32, height: u32, format: ImageFormat, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    let img = ImageBuffer::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        Rgb([r, g, b])
    });
    let img = DynamicImage::ImageRgb8(img);
    let mut bytes = Cursor::new(Vec::new());
    if format == ImageFormat::Jpeg {
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, 100))
            .expect("encode fixture");
    } else {
        img.write_to(&mut bytes, format).expect("encode fixture");
    }
    bytes.into_inner()
}

#[tokio::test]
async fn compression_pipeline_happy_path_marks_job_done() {
    let h = harness().await;
    let engine = Arc::new(MockEngine::default());
    let pipeline = h.pipeline(engine.clone());

    let job = h.submit("holiday.png", "image/png", b"0123456789").await;
    let task = reserve_task(&h.db, "worker-happy").await;

    pipeline
        .process_task(task.clone())
        .await
        .expect("pipeline succeeds");

    let done = h.job(&job.id).await;
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.compressed_size, Some(5));
    assert!(done.completed_at.is_some());
    assert_eq!(done.savings_percent(), 50);

    let output = done.output_path.clone().expect("output locator");
    assert!(output.ends_with("_compressed.png"));
    assert_eq!(std::fs::read(&output).expect("artifact on disk"), b"01234");

    assert_eq!(h.task(&task.id).await.state, TaskState::Succeeded);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn compression_pipeline_retries_then_dead_letters() {
    let h = harness().await;
    let pipeline = h.pipeline(Arc::new(FailingEngine));
    let job = h.submit("broken.jpg", "image/jpeg", b"not really a jpeg").await;

    let first = reserve_task(&h.db, "worker-fail").await;
    assert!(pipeline.process_task(first.clone()).await.is_err());

    let stored = h.task(&first.id).await;
    assert_eq!(stored.state, TaskState::Failed);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error_code.as_deref(), Some("INTERNAL_ERROR"));
    assert!(
        stored.scheduled_at > Utc::now() - ChronoDuration::seconds(5),
        "failed task should schedule retry in the future"
    );
    assert_eq!(h.job(&job.id).await.status, JobStatus::Processing);

    for expected_attempt in 2..=3 {
        let later = Utc::now() + ChronoDuration::seconds(600);
        let task = reserve_task_at(&h.db, "worker-fail", later).await;
        assert_eq!(task.attempts, expected_attempt);
        assert!(pipeline.process_task(task).await.is_err());
    }

    let stored = h.task(&first.id).await;
    assert_eq!(stored.state, TaskState::DeadLetter);
    assert_eq!(stored.attempts, 3);

    let failed = h.job(&job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed
        .error_message
        .as_deref()
        .is_some_and(|msg| msg.contains("decoder ran out of data")));
}

#[tokio::test]
async fn compression_pipeline_validation_failure_dead_letters_task() {
    let h = harness().await;
    let pipeline = h.pipeline(Arc::new(ValidationEngine));
    let job = h.submit("odd.png", "image/png", b"png-ish").await;

    let task = reserve_task(&h.db, "worker-validation").await;
    assert!(pipeline.process_task(task.clone()).await.is_err());

    let stored = h.task(&task.id).await;
    assert_eq!(stored.state, TaskState::DeadLetter);
    assert_eq!(stored.attempts, 1);
    assert_eq!(h.job(&job.id).await.status, JobStatus::Failed);
}

#[tokio::test]
async fn redelivered_task_for_done_job_is_acknowledged() {
    let h = harness().await;
    let engine = Arc::new(MockEngine::default());
    let pipeline = h.pipeline(engine.clone());
    let job = h.submit("twice.png", "image/png", b"abcdefgh").await;

    let task = reserve_task(&h.db, "worker-a").await;
    pipeline.process_task(task.clone()).await.expect("first run");
    let done = h.job(&job.id).await;

    let duplicate = CompressionTask::create_and_add_to_db(task.payload.clone(), &h.db)
        .await
        .expect("duplicate task");
    let redelivered = reserve_task(&h.db, "worker-b").await;
    assert_eq!(redelivered.id, duplicate.id);
    pipeline
        .process_task(redelivered)
        .await
        .expect("redelivery is a no-op");

    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    let after = h.job(&job.id).await;
    assert_eq!(after.output_path, done.output_path);
    assert_eq!(after.completed_at, done.completed_at);
    assert_eq!(h.task(&duplicate.id).await.state, TaskState::Succeeded);
}

#[tokio::test]
async fn task_for_missing_job_is_acknowledged() {
    let h = harness().await;
    let engine = Arc::new(MockEngine::default());
    let pipeline = h.pipeline(engine.clone());

    let orphan = CompressionTask::create_and_add_to_db(
        TaskPayload {
            job_id: "swept-job".into(),
            input_path: "/nowhere/swept.png".into(),
            mime_type: "image/png".into(),
            quality: 75,
        },
        &h.db,
    )
    .await
    .expect("task");

    let task = reserve_task(&h.db, "worker-orphan").await;
    pipeline.process_task(task).await.expect("no-op");

    assert_eq!(h.task(&orphan.id).await.state, TaskState::Succeeded);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remote_backend_receives_artifact_and_local_files_are_removed() {
    let h = harness().await;
    let remote = StorageManager::with_backend(Arc::new(InMemory::new()), StorageKind::S3);
    let pipeline = CompressionPipeline::with_engine(
        Arc::clone(&h.db),
        remote.clone(),
        PipelineConfig::default(),
        Arc::new(MockEngine::default()),
    );

    let job = h.submit("remote.png", "image/png", b"0123456789").await;
    let task = reserve_task(&h.db, "worker-remote").await;
    pipeline.process_task(task).await.expect("pipeline succeeds");

    let done = h.job(&job.id).await;
    let locator = done.output_path.clone().expect("locator");
    assert_eq!(locator, format!("compressed/{}.png", job.id));
    assert_eq!(
        remote.get_buffer(&locator).await.expect("remote object").as_ref(),
        b"01234"
    );

    let input = Path::new(&job.storage_path);
    assert!(!input.exists(), "upload should be removed after migration");
    assert!(!super::compressed_output_path(input).exists());
}

#[tokio::test]
async fn jpeg_upload_is_compressed_end_to_end() {
    let h = harness().await;
    let pipeline = h.pipeline(Arc::new(ImageEngine));

    // Photo-sized upload of roughly 2 MB.
    let mut width = 1024;
    let mut original = encoded(width, 768, ImageFormat::Jpeg, 7);
    while original.len() < 2_000_000 && width < 4096 {
        width += 256;
        original = encoded(width, 768, ImageFormat::Jpeg, 7);
    }
    assert!(original.len() >= 1_500_000, "fixture is {} bytes", original.len());

    let job = h.submit("noise.jpg", "image/jpeg", &original).await;
    let task = reserve_task(&h.db, "worker-e2e").await;
    pipeline.process_task(task).await.expect("pipeline succeeds");

    let view = h.service.get_status(&job.id).await.expect("status");
    assert_eq!(view.status, JobStatus::Done);
    let compressed = view.compressed_size.expect("compressed size");
    assert!(compressed < original.len() as u64);
    assert!(view.savings_percent > 0);
    assert!(view.download_url.is_some());

    let output = h.service.fetch_output(&job.id).await.expect("download");
    assert_eq!(output.data.len() as u64, compressed);
    assert_eq!(output.file_name, "noise_compressed.jpg");
    image::load_from_memory_with_format(&output.data, ImageFormat::Jpeg).expect("valid jpeg");
}

#[tokio::test]
async fn batch_of_pngs_is_zipped_after_processing() {
    let h = harness().await;
    let pipeline = h.pipeline(Arc::new(ImageEngine));

    let uploads = ["one", "two", "three"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut file = NamedTempFile::new().expect("temp file");
            let seed = u32::try_from(i).expect("small index") + 1;
            file.write_all(&encoded(48, 32, ImageFormat::Png, seed))
                .expect("write upload");
            UploadedFile {
                file,
                file_name: format!("{name}.png"),
                content_type: Some("image/png".into()),
            }
        })
        .collect();
    let submission = h
        .service
        .submit_batch(uploads, 60, None)
        .await
        .expect("batch");
    assert_eq!(submission.jobs.len(), 3);

    for _ in 0..3 {
        let task = reserve_task(&h.db, "worker-batch").await;
        pipeline.process_task(task).await.expect("pipeline succeeds");
    }

    let zipped = h
        .service
        .batch_zip(&submission.batch_id)
        .await
        .expect("zip");
    let mut archive = zip::ZipArchive::new(Cursor::new(zipped)).expect("read zip");
    assert_eq!(archive.len(), 3);

    let mut names = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).expect("entry");
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("entry data");
        image::load_from_memory_with_format(&data, ImageFormat::Png).expect("valid png");
        names.push(entry.name().to_string());
    }
    names.sort();
    assert_eq!(
        names,
        ["one_compressed.png", "three_compressed.png", "two_compressed.png"]
    );
}
