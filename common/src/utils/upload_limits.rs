use mime_guess::from_path;

use super::config::AppConfig;
use crate::error::AppError;

pub const ALLOWED_MIME_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/avif"];
pub const DEFAULT_QUALITY: u8 = 75;

/// Picks the declared multipart content type, falling back to a guess from the file name.
pub fn resolve_mime_type(declared: Option<&str>, file_name: &str) -> String {
    declared
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != mime::APPLICATION_OCTET_STREAM.as_ref())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| {
            from_path(file_name)
                .first_or(mime::APPLICATION_OCTET_STREAM)
                .to_string()
        })
}

pub fn is_allowed_mime_type(mime_type: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&mime_type)
}

pub fn validate_upload(config: &AppConfig, mime_type: &str, size: u64) -> Result<(), AppError> {
    if !is_allowed_mime_type(mime_type) {
        return Err(AppError::InvalidFileType(mime_type.to_string()));
    }

    if size > config.upload_max_bytes {
        return Err(AppError::FileTooLarge {
            size,
            limit: config.upload_max_bytes,
        });
    }

    Ok(())
}

pub fn validate_batch_size(config: &AppConfig, file_count: usize) -> Result<(), AppError> {
    if file_count == 0 {
        return Err(AppError::NoFile);
    }

    if file_count > config.upload_max_files {
        return Err(AppError::Validation(format!(
            "Too many files. Maximum allowed is {}",
            config.upload_max_files
        )));
    }

    Ok(())
}

/// Parses the optional `quality` form field. Absent or blank means the default.
pub fn parse_quality(raw: Option<&str>) -> Result<u8, AppError> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(DEFAULT_QUALITY);
    };

    let value: f64 = raw
        .parse()
        .map_err(|_| AppError::Validation(format!("Quality must be a number, got '{raw}'")))?;

    if !value.is_finite() || !(1.0..=100.0).contains(&value) {
        return Err(AppError::Validation(format!(
            "Quality must be between 1 and 100, got {raw}"
        )));
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(value.round() as u8)
}
