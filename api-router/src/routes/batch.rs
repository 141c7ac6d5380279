use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use axum_typed_multipart::{FieldData, TryFromMultipart};
use common::utils::upload_limits::parse_quality;
use tempfile::NamedTempFile;
use tracing::info;

use super::compress::{uploaded_file, ApiMultipart};
use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::Identity};

#[derive(Debug, TryFromMultipart)]
pub struct BatchParams {
    #[form_data(limit = "unlimited")]
    #[form_data(default)]
    pub images: Vec<FieldData<NamedTempFile>>,
    pub quality: Option<String>,
}

pub async fn submit_batch(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    input: ApiMultipart<BatchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let BatchParams { images, quality } = input.data;
    let quality = parse_quality(quality.as_deref())?;

    info!(
        user_id = identity.user().map(|u| u.id.as_str()),
        file_count = images.len(),
        quality,
        "Received batch compression request"
    );

    let uploads = images.into_iter().map(uploaded_file).collect();
    let submission = state
        .compression
        .submit_batch(uploads, quality, identity.user())
        .await?;

    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn download_batch_zip(
    State(state): State<ApiState>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let archive = state.compression.batch_zip(&batch_id).await?;
    let disposition = format!("attachment; filename=\"batch_{batch_id}.zip\"");

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    ))
}
