use std::path::{Path, PathBuf};

use bytes::Bytes;
use common::{
    error::AppError,
    storage::{store::COMPRESSED_PREFIX, types::compression_job::clamp_quality},
};
use state_machines::core::GuardError;
use tracing::{debug, info, instrument};

use super::{
    context::PipelineContext,
    state::{Completed, CompressionMachine, Compressed, Ready, Started, Stored},
};

/// `{stem}_compressed{ext}` next to the input.
pub fn compressed_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match input.extension() {
        Some(ext) => format!("{stem}_compressed.{}", ext.to_string_lossy()),
        None => format!("{stem}_compressed"),
    };
    input.with_file_name(file_name)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}

#[instrument(level = "trace", skip_all, fields(task_id = %ctx.task_id, job_id = %ctx.job_id))]
pub async fn start(
    machine: CompressionMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<CompressionMachine<(), Started>, AppError> {
    ctx.job = ctx.job.mark_processing(ctx.db).await?;

    machine
        .start()
        .map_err(|(_, guard)| map_guard_error("start", &guard))
}

#[instrument(level = "trace", skip_all, fields(task_id = %ctx.task_id, job_id = %ctx.job_id))]
pub async fn compress(
    machine: CompressionMachine<(), Started>,
    ctx: &mut PipelineContext<'_>,
) -> Result<CompressionMachine<(), Compressed>, AppError> {
    let task = ctx.task;
    let payload = &task.payload;
    let input_path = Path::new(&payload.input_path);
    let input = Bytes::from(tokio::fs::read(input_path).await?);
    let input_len = input.len();

    let output = ctx
        .engine
        .compress(input, &payload.mime_type, clamp_quality(i64::from(payload.quality)))
        .await?;

    let output_path = compressed_output_path(input_path);
    tokio::fs::write(&output_path, &output).await?;

    info!(
        task_id = %ctx.task_id,
        job_id = %ctx.job_id,
        input_bytes = input_len,
        output_bytes = output.len(),
        "image compressed"
    );

    ctx.compressed_size = Some(output.len() as u64);
    ctx.local_output = Some(output_path);

    machine
        .compress()
        .map_err(|(_, guard)| map_guard_error("compress", &guard))
}

/// Moves the artifact to durable storage. On a local backend the file already is durable.
#[instrument(level = "trace", skip_all, fields(task_id = %ctx.task_id, job_id = %ctx.job_id))]
pub async fn store(
    machine: CompressionMachine<(), Compressed>,
    ctx: &mut PipelineContext<'_>,
) -> Result<CompressionMachine<(), Stored>, AppError> {
    let local_output = ctx.local_output()?.clone();

    let locator = if ctx.storage.is_remote() {
        let key = format!(
            "{COMPRESSED_PREFIX}/{}{}",
            ctx.job_id,
            extension_of(&local_output)
        );
        let locator = ctx.storage.save(&local_output, &key).await?;

        for leftover in [Path::new(&ctx.task.payload.input_path), local_output.as_path()] {
            if let Err(err) = tokio::fs::remove_file(leftover).await {
                debug!(path = %leftover.display(), error = %err, "failed to remove local file");
            }
        }
        locator
    } else {
        local_output.to_string_lossy().into_owned()
    };

    ctx.locator = Some(locator);

    machine
        .store()
        .map_err(|(_, guard)| map_guard_error("store", &guard))
}

#[instrument(level = "trace", skip_all, fields(task_id = %ctx.task_id, job_id = %ctx.job_id))]
pub async fn complete(
    machine: CompressionMachine<(), Stored>,
    ctx: &mut PipelineContext<'_>,
) -> Result<CompressionMachine<(), Completed>, AppError> {
    let locator = ctx
        .locator
        .clone()
        .ok_or_else(|| AppError::InternalError("storage locator expected".into()))?;
    let compressed_size = ctx
        .compressed_size
        .ok_or_else(|| AppError::InternalError("compressed size expected".into()))?;

    ctx.job = ctx.job.mark_done(locator, compressed_size, ctx.db).await?;

    machine
        .complete()
        .map_err(|(_, guard)| map_guard_error("complete", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid compression pipeline transition during {event}: {guard:?}"
    ))
}
