use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("No file uploaded")]
    NoFile,
    #[error("Unsupported file type: {0}. Allowed: JPG, PNG, WebP, AVIF")]
    InvalidFileType(String),
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("Daily upload quota exceeded ({limit} per day)")]
    QuotaExceeded { limit: u32 },
    #[error("File not ready yet: {0}")]
    NotReady(String),
    #[error("File expired or deleted: {0}")]
    Expired(String),
    #[error("No completed jobs in batch {0}")]
    BatchNotReady(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Image codec error: {0}")]
    Codec(String),
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Compression Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a failed processing attempt is worth redelivering.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::Validation(_)
                | AppError::InvalidFileType(_)
                | AppError::FileTooLarge { .. }
                | AppError::NoFile
        )
    }

    /// Stable machine-readable code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "JOB_NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NoFile => "NO_FILE",
            AppError::InvalidFileType(_) => "INVALID_FILE_TYPE",
            AppError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            AppError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            AppError::NotReady(_) => "NOT_READY",
            AppError::Expired(_) => "FILE_EXPIRED",
            AppError::BatchNotReady(_) => "BATCH_NOT_READY",
            AppError::Auth(_) => "UNAUTHORIZED",
            _ => "INTERNAL_ERROR",
        }
    }
}
