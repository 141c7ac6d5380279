use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::Identity};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

pub async fn get_history(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let user = identity.required()?;
    let page = state
        .compression
        .list_history(&user.id, params.page, params.page_size)
        .await?;

    Ok(Json(page))
}
