use axum::{extract::State, response::IntoResponse, Extension, Json};

use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::Identity};

pub async fn get_usage(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let user = identity.required()?;
    let report = state.compression.usage(&user).await?;

    Ok(Json(report))
}
