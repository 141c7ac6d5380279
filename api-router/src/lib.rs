use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use middleware_api_auth::api_auth;
use routes::{
    batch::{download_batch_zip, submit_batch},
    compress::{
        download_output, get_job_status, preview_output, serve_local_file, submit_compression,
    },
    history::get_history,
    liveness::live,
    readiness::ready,
    usage::get_usage,
};

pub mod api_state;
pub mod error;
mod middleware_api_auth;
mod routes;

/// Multipart framing allowance on top of the raw file bytes.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

fn body_limit(file_bytes: u64, files: usize) -> usize {
    usize::try_from(file_bytes)
        .unwrap_or(usize::MAX)
        .saturating_mul(files.max(1))
        .saturating_add(MULTIPART_OVERHEAD_BYTES)
}

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    let config = &app_state.config;

    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    // Identity is optional here; history and usage insist on it.
    let compression = Router::new()
        .route(
            "/compress",
            post(submit_compression)
                .layer(DefaultBodyLimit::max(body_limit(config.upload_max_bytes, 1))),
        )
        .route(
            "/compress/batch",
            post(submit_batch).layer(DefaultBodyLimit::max(body_limit(
                config.upload_max_bytes,
                config.upload_max_files,
            ))),
        )
        .route("/compress/batch/{batch_id}/zip", get(download_batch_zip))
        .route("/compress/history", get(get_history))
        .route("/compress/files/{file_name}", get(serve_local_file))
        .route("/compress/{job_id}", get(get_job_status))
        .route("/compress/{job_id}/download", get(download_output))
        .route("/compress/{job_id}/preview", get(preview_output))
        .route("/user/usage", get(get_usage))
        .route_layer(from_fn_with_state(app_state.clone(), api_auth));

    public.merge(compression)
}
