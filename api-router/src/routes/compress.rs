use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use axum_typed_multipart::{BaseMultipart, FieldData, TryFromMultipart};
use common::{
    compression::{OutputFile, UploadedFile},
    error::AppError,
    utils::upload_limits::parse_quality,
};
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::Identity};

pub type ApiMultipart<T> = BaseMultipart<T, ApiError>;

#[derive(Debug, TryFromMultipart)]
pub struct CompressParams {
    #[form_data(limit = "unlimited")]
    pub image: Option<FieldData<NamedTempFile>>,
    pub quality: Option<String>,
}

pub(crate) fn uploaded_file(field: FieldData<NamedTempFile>) -> UploadedFile {
    UploadedFile {
        file: field.contents,
        file_name: field
            .metadata
            .file_name
            .unwrap_or_else(|| "upload".to_string()),
        content_type: field.metadata.content_type,
    }
}

pub async fn submit_compression(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    input: ApiMultipart<CompressParams>,
) -> Result<impl IntoResponse, ApiError> {
    let CompressParams { image, quality } = input.data;
    let image = image.ok_or(AppError::NoFile)?;
    let quality = parse_quality(quality.as_deref())?;

    info!(
        user_id = identity.user().map(|u| u.id.as_str()),
        quality,
        "Received compression request"
    );

    let job = state
        .compression
        .submit(uploaded_file(image), quality, identity.user())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": job.id, "status": job.status })),
    ))
}

pub async fn get_job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.compression.get_status(&job_id).await?;

    Ok(Json(view))
}

pub async fn download_output(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let output = state.compression.fetch_output(&job_id).await?;
    let disposition = format!("attachment; filename=\"{}\"", output.file_name);

    file_response(output, &disposition, None)
}

pub async fn preview_output(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let output = state.compression.fetch_output(&job_id).await?;

    file_response(output, "inline", Some("public, max-age=3600"))
}

/// Serves artifacts of the local backend by file name.
pub async fn serve_local_file(
    State(state): State<ApiState>,
    Path(file_name): Path<String>,
) -> Result<Response, ApiError> {
    let locator = state
        .storage
        .local_file_locator(&file_name)
        .ok_or_else(|| AppError::NotFound(format!("File {file_name} not found")))?;
    let data = state.storage.get_buffer(&locator).await?;
    let mime_type = mime_guess::from_path(&file_name)
        .first_or_octet_stream()
        .to_string();

    file_response(
        OutputFile {
            data,
            mime_type,
            file_name,
        },
        "inline",
        None,
    )
}

fn file_response(
    output: OutputFile,
    disposition: &str,
    cache_control: Option<&'static str>,
) -> Result<Response, ApiError> {
    let content_type = HeaderValue::from_str(&output.mime_type)
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    let disposition =
        HeaderValue::from_str(disposition).map_err(|e| AppError::InternalError(e.to_string()))?;

    let mut response = Response::new(Body::from(output.data));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    if let Some(cache_control) = cache_control {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }

    Ok(response)
}
