mod service;

pub use service::CompressionService;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::storage::types::compression_job::{CompressionJob, CompressionLevel, JobStatus};

pub const API_PREFIX: &str = "/api/v1";
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// A file received from a client, still in its temporary location.
#[derive(Debug)]
pub struct UploadedFile {
    pub file: NamedTempFile,
    pub file_name: String,
    pub content_type: Option<String>,
}

/// Client-facing projection of a job record.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    pub batch_id: Option<String>,
    pub status: JobStatus,
    pub original_name: String,
    pub original_size: u64,
    pub compressed_size: Option<u64>,
    pub savings_percent: i64,
    pub mime_type: String,
    pub quality: u8,
    pub level: CompressionLevel,
    pub error_message: Option<String>,
    pub download_url: Option<String>,
    pub preview_url: Option<String>,
    /// Direct storage URL of the artifact, filled in by the service.
    pub file_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl From<&CompressionJob> for JobView {
    fn from(job: &CompressionJob) -> Self {
        let done = job.status == JobStatus::Done;
        Self {
            job_id: job.id.clone(),
            batch_id: job.batch_id.clone(),
            status: job.status,
            original_name: job.original_name.clone(),
            original_size: job.original_size,
            compressed_size: job.compressed_size,
            savings_percent: job.savings_percent(),
            mime_type: job.mime_type.clone(),
            quality: job.quality,
            level: job.level,
            error_message: job.error_message.clone(),
            download_url: done.then(|| format!("{API_PREFIX}/compress/{}/download", job.id)),
            preview_url: done.then(|| format!("{API_PREFIX}/compress/{}/preview", job.id)),
            file_url: None,
            created_at: job.created_at,
            completed_at: job.completed_at,
            expires_at: job.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub items: Vec<JobView>,
    pub total: i64,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Pending,
    Rejected,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub original_name: String,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSubmission {
    pub batch_id: String,
    pub jobs: Vec<BatchEntry>,
}

/// Compressed bytes ready to be sent to a client.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub data: Bytes,
    pub mime_type: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub tier: &'static str,
    pub daily_uploads: u32,
    /// `-1` for unlimited tiers.
    pub daily_limit: i64,
    pub total_jobs: i64,
    pub total_bytes_saved: i64,
    pub reset_at: DateTime<Utc>,
}
