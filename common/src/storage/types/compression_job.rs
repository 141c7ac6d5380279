use std::path::Path;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const DEFAULT_JOB_TTL_HOURS: i64 = 24;
pub const MAX_PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    #[default]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Display classification of the requested quality. Does not influence the codec.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum CompressionLevel {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
}

impl CompressionLevel {
    pub fn from_quality(quality: u8) -> Self {
        match quality {
            70.. => CompressionLevel::Low,
            40..=69 => CompressionLevel::Medium,
            _ => CompressionLevel::High,
        }
    }
}

/// Clamps any requested quality into the 1..=100 range the codec accepts.
pub fn clamp_quality(quality: i64) -> u8 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamped = quality.clamp(1, 100) as u8;
    clamped
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    Start,
    Complete,
    Fail,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::Start => "start",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Pending,
        states: [Pending, Processing, Done, Failed],
        events {
            start {
                transition: { from: Pending, to: Processing }
            }
            complete {
                transition: { from: Processing, to: Done }
            }
            fail {
                transition: { from: Pending, to: Failed }
                transition: { from: Processing, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> JobLifecycleMachine<(), Pending> {
        JobLifecycleMachine::new(())
    }
}

fn invalid_transition(status: &JobStatus, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(status: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::pending;
    match (status, event) {
        (JobStatus::Pending, JobTransition::Start) => pending()
            .start()
            .map(|_| JobStatus::Processing)
            .map_err(|_| invalid_transition(status, event)),
        // A redelivered task resumes a job that never reached a terminal state.
        (JobStatus::Processing, JobTransition::Start) => Ok(JobStatus::Processing),
        (JobStatus::Processing, JobTransition::Complete) => pending()
            .start()
            .map_err(|_| invalid_transition(status, event))?
            .complete()
            .map(|_| JobStatus::Done)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Pending, JobTransition::Fail) => pending()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Processing, JobTransition::Fail) => pending()
            .start()
            .map_err(|_| invalid_transition(status, event))?
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        _ => Err(invalid_transition(status, event)),
    }
}

stored_object!(CompressionJob, "compression_job", {
    batch_id: Option<String>,
    user_id: Option<String>,
    status: JobStatus,
    original_name: String,
    original_size: u64,
    mime_type: String,
    quality: u8,
    level: CompressionLevel,
    storage_path: String,
    output_path: Option<String>,
    compressed_size: Option<u64>,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    expires_at: DateTime<Utc>
});

/// The upload facts a job is created from.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub batch_id: Option<String>,
    pub user_id: Option<String>,
    pub original_name: String,
    pub original_size: u64,
    pub mime_type: String,
    pub quality: u8,
    pub storage_path: String,
}

#[derive(Deserialize)]
struct CountResult {
    count: i64,
}

#[derive(Deserialize)]
struct SavingsResult {
    count: i64,
    saved: Option<i64>,
}

/// Totals over a user's finished jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobTotals {
    pub done_jobs: i64,
    pub bytes_saved: i64,
}

impl CompressionJob {
    pub fn new(draft: JobDraft, ttl: ChronoDuration) -> Self {
        let now = chrono::Utc::now();
        let quality = clamp_quality(i64::from(draft.quality));

        Self {
            id: Uuid::new_v4().to_string(),
            batch_id: draft.batch_id,
            user_id: draft.user_id,
            status: JobStatus::Pending,
            original_name: draft.original_name,
            original_size: draft.original_size,
            mime_type: draft.mime_type,
            quality,
            level: CompressionLevel::from_quality(quality),
            storage_path: draft.storage_path,
            output_path: None,
            compressed_size: None,
            error_message: None,
            completed_at: None,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn create_and_add_to_db(
        draft: JobDraft,
        ttl: ChronoDuration,
        db: &SurrealDbClient,
    ) -> Result<CompressionJob, AppError> {
        let job = Self::new(draft, ttl);
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<CompressionJob, AppError> {
        db.get_item::<CompressionJob>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))
    }

    /// Rounded percentage of bytes saved, 0 until the compressed size is known.
    pub fn savings_percent(&self) -> i64 {
        match self.compressed_size {
            Some(compressed) if self.original_size > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let ratio = (self.original_size as f64 - compressed as f64) / self.original_size as f64;
                #[allow(clippy::cast_possible_truncation)]
                let percent = (ratio * 100.0).round() as i64;
                percent
            }
            _ => 0,
        }
    }

    /// `{basename}_compressed{ext}`, used for downloads and archive entries.
    pub fn archive_name(&self) -> String {
        let path = Path::new(&self.original_name);
        let base = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone());
        match path.extension() {
            Some(ext) => format!("{base}_compressed.{}", ext.to_string_lossy()),
            None => format!("{base}_compressed"),
        }
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<CompressionJob, AppError> {
        let next = compute_next_status(&self.status, JobTransition::Start)?;
        debug_assert_eq!(next, JobStatus::Processing);

        const START_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $processing,
                updated_at = $now
            WHERE status IN $allow_states
            RETURN AFTER;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(START_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("processing", JobStatus::Processing.as_str()))
            .bind((
                "allow_states",
                vec![JobStatus::Pending.as_str(), JobStatus::Processing.as_str()],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<CompressionJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Start))
    }

    pub async fn mark_done(
        &self,
        output_path: String,
        compressed_size: u64,
        db: &SurrealDbClient,
    ) -> Result<CompressionJob, AppError> {
        let next = compute_next_status(&self.status, JobTransition::Complete)?;
        debug_assert_eq!(next, JobStatus::Done);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $done,
                output_path = $output_path,
                compressed_size = $compressed_size,
                completed_at = $now,
                error_message = NONE,
                updated_at = $now
            WHERE status = $processing
            RETURN AFTER;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("done", JobStatus::Done.as_str()))
            .bind(("processing", JobStatus::Processing.as_str()))
            .bind(("output_path", output_path))
            .bind(("compressed_size", compressed_size))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<CompressionJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Complete))
    }

    pub async fn mark_failed(
        &self,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<CompressionJob, AppError> {
        let next = compute_next_status(&self.status, JobTransition::Fail)?;
        debug_assert_eq!(next, JobStatus::Failed);

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $failed,
                error_message = $error_message,
                updated_at = $now
            WHERE status IN $allow_states
            RETURN AFTER;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", JobStatus::Failed.as_str()))
            .bind(("error_message", message.to_string()))
            .bind((
                "allow_states",
                vec![JobStatus::Pending.as_str(), JobStatus::Processing.as_str()],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<CompressionJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Fail))
    }

    pub async fn find_by_batch(
        batch_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<CompressionJob>, AppError> {
        let jobs: Vec<CompressionJob> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE batch_id = $batch_id
                 ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("batch_id", batch_id.to_string()))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// One page of a user's jobs, newest first, plus the user's total job count.
    pub async fn list_for_user(
        user_id: &str,
        page: usize,
        page_size: usize,
        db: &SurrealDbClient,
    ) -> Result<(Vec<CompressionJob>, i64), AppError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let start = (page - 1).saturating_mul(page_size);

        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE user_id = $user_id
                 ORDER BY created_at DESC
                 LIMIT $limit START $start;
                 SELECT count() AS count FROM type::table($table)
                 WHERE user_id = $user_id
                 GROUP ALL;",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .bind(("limit", page_size))
            .bind(("start", start))
            .await?;

        let jobs: Vec<CompressionJob> = response.take(0)?;
        let total: Option<CountResult> = response.take(1)?;

        Ok((jobs, total.map_or(0, |r| r.count)))
    }

    pub async fn totals_for_user(user_id: &str, db: &SurrealDbClient) -> Result<JobTotals, AppError> {
        let result: Option<SavingsResult> = db
            .query(
                "SELECT count() AS count, math::sum(original_size - compressed_size) AS saved
                 FROM type::table($table)
                 WHERE user_id = $user_id AND status = $done
                 GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .bind(("done", JobStatus::Done.as_str()))
            .await?
            .take(0)?;

        Ok(result.map_or_else(JobTotals::default, |r| JobTotals {
            done_jobs: r.count,
            bytes_saved: r.saved.unwrap_or(0),
        }))
    }

    pub async fn find_expired(
        now: chrono::DateTime<chrono::Utc>,
        db: &SurrealDbClient,
    ) -> Result<Vec<CompressionJob>, AppError> {
        let jobs: Vec<CompressionJob> = db
            .query("SELECT * FROM type::table($table) WHERE expires_at < $now")
            .bind(("table", Self::table_name()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// Removes the given job records in a single statement.
    pub async fn delete_many(ids: Vec<String>, db: &SurrealDbClient) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }

        db.query(
            "FOR $id IN $ids {
                DELETE type::thing($table, $id);
            };",
        )
        .bind(("table", Self::table_name()))
        .bind(("ids", ids))
        .await?
        .check()?;

        Ok(())
    }
}
