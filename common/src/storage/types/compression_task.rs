use std::time::Duration;

use chrono::Duration as ChronoDuration;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::db::{retry_on_conflict, SurrealDbClient},
    stored_object,
};

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 300;
pub const KEEP_SUCCEEDED_TASKS: usize = 100;
pub const KEEP_DEAD_LETTER_TASKS: usize = 50;

/// Queue-side state of one delivery of a compression job.
///
/// `Failed` means "waiting for the next attempt"; `DeadLetter` is where a task
/// ends once its attempts are spent or the error is not worth retrying.
#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum TaskState {
    #[default]
    Pending,
    Reserved,
    Processing,
    Succeeded,
    Failed,
    DeadLetter,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Reserved => "Reserved",
            TaskState::Processing => "Processing",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::DeadLetter => "DeadLetter",
        }
    }

    /// States a claim may pick up and count as a fresh attempt.
    const CLAIMABLE: [TaskState; 2] = [TaskState::Pending, TaskState::Failed];

    /// States a claim may take over once the holder's lease ran out.
    const LEASED: [TaskState; 2] = [TaskState::Reserved, TaskState::Processing];
}

/// What a worker needs to compress one upload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TaskPayload {
    pub job_id: String,
    pub input_path: String,
    pub mime_type: String,
    pub quality: u8,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct TaskErrorInfo {
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskEvent {
    StartProcessing,
    Succeed,
    Fail,
    DeadLetter,
}

impl TaskEvent {
    fn as_str(self) -> &'static str {
        match self {
            TaskEvent::StartProcessing => "start_processing",
            TaskEvent::Succeed => "succeed",
            TaskEvent::Fail => "fail",
            TaskEvent::DeadLetter => "deadletter",
        }
    }

    /// Source and target state. Reserving is done in bulk by the claim query.
    fn edge(self) -> (TaskState, TaskState) {
        match self {
            TaskEvent::StartProcessing => (TaskState::Reserved, TaskState::Processing),
            TaskEvent::Succeed => (TaskState::Processing, TaskState::Succeeded),
            TaskEvent::Fail => (TaskState::Processing, TaskState::Failed),
            TaskEvent::DeadLetter => (TaskState::Failed, TaskState::DeadLetter),
        }
    }

    /// Dead-lettering happens after the lease was released, so it is not tied to a worker.
    fn requires_owner(self) -> bool {
        !matches!(self, TaskEvent::DeadLetter)
    }
}

fn invalid_transition(state: TaskState, event: TaskEvent) -> AppError {
    AppError::Validation(format!(
        "Invalid task transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

enum ErrorWrite {
    Keep,
    Clear,
    Set(TaskErrorInfo),
}

/// Column values one lifecycle step writes next to the new state.
struct StepWrite {
    event: TaskEvent,
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    worker_id: Option<String>,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    error: ErrorWrite,
    last_error_at: Option<chrono::DateTime<chrono::Utc>>,
}

stored_object!(CompressionTask, "compression_task", {
    payload: TaskPayload,
    state: TaskState,
    attempts: u32,
    max_attempts: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    scheduled_at: chrono::DateTime<chrono::Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    lease_duration_secs: i64,
    worker_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_error_at: Option<chrono::DateTime<chrono::Utc>>
});

impl CompressionTask {
    pub fn new(payload: TaskPayload) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: MAX_ATTEMPTS,
            scheduled_at: now,
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            worker_id: None,
            error_code: None,
            error_message: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub async fn create_and_add_to_db(
        payload: TaskPayload,
        db: &SurrealDbClient,
    ) -> Result<CompressionTask, AppError> {
        let task = Self::new(payload);
        db.store_item(task.clone()).await?;
        Ok(task)
    }

    /// Leases the oldest runnable task to `worker_id`.
    ///
    /// Picking up a Pending or Failed task spends one attempt. Tasks left in
    /// Reserved or Processing by a worker whose lease ran out are handed out
    /// again without spending another.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: chrono::DateTime<chrono::Utc>,
        lease_duration: Duration,
    ) -> Result<Option<CompressionTask>, AppError> {
        // SET assignments run left to right: `attempts` must read the state
        // before it is overwritten.
        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE scheduled_at <= $now
                  AND (
                        (state IN $claimable AND attempts < max_attempts)
                        OR (
                            state IN $leased
                            AND time::unix($now) - time::unix(locked_at) >= lease_duration_secs
                        )
                  )
                ORDER BY scheduled_at ASC, created_at ASC
                LIMIT 1
            )
            SET attempts = if state IN $claimable THEN attempts + 1 ELSE attempts END,
                state = $reserved,
                locked_at = $now,
                worker_id = $worker_id,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            RETURN *;
        "#;

        let stamp = SurrealDatetime::from(now);
        let lease_secs = i64::try_from(lease_duration.as_secs()).unwrap_or(DEFAULT_LEASE_SECS);
        let claimable: Vec<&str> = TaskState::CLAIMABLE.iter().map(TaskState::as_str).collect();
        let leased: Vec<&str> = TaskState::LEASED.iter().map(TaskState::as_str).collect();

        // Concurrent workers race for the same row; the loser reruns the claim.
        let task = retry_on_conflict(|| {
            let (stamp, worker_id) = (stamp.clone(), worker_id.to_string());
            let (claimable, leased) = (claimable.clone(), leased.clone());
            async move {
                let task: Option<CompressionTask> = db
                    .client
                    .query(CLAIM_QUERY)
                    .bind(("table", Self::table_name()))
                    .bind(("claimable", claimable))
                    .bind(("leased", leased))
                    .bind(("reserved", TaskState::Reserved.as_str()))
                    .bind(("now", stamp))
                    .bind(("worker_id", worker_id))
                    .bind(("lease_secs", lease_secs))
                    .await?
                    .take(0)?;
                Ok::<_, surrealdb::Error>(task)
            }
        })
        .await?;

        Ok(task)
    }

    /// Writes one lifecycle step, guarded on the current state (and on the
    /// lease holder, where the step belongs to a worker). A task that moved on
    /// in the meantime yields a validation error instead of being overwritten.
    async fn step(
        &self,
        write: StepWrite,
        db: &SurrealDbClient,
    ) -> Result<CompressionTask, AppError> {
        let (from, to) = write.event.edge();
        if self.state != from {
            return Err(invalid_transition(self.state, write.event));
        }

        const STEP_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $to,
                updated_at = $now,
                locked_at = $locked_at,
                worker_id = $next_worker,
                scheduled_at = $scheduled_at,
                error_code = $error_code,
                error_message = $error_message,
                last_error_at = $last_error_at
            WHERE state = $from
              AND ($check_owner = false OR worker_id = $owner)
            RETURN *;
        "#;

        let (error_code, error_message) = match write.error {
            ErrorWrite::Keep => (self.error_code.clone(), self.error_message.clone()),
            ErrorWrite::Clear => (None, None),
            ErrorWrite::Set(error) => (error.code, Some(error.message)),
        };

        let updated: Option<CompressionTask> = db
            .client
            .query(STEP_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("from", from.as_str()))
            .bind(("to", to.as_str()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .bind(("locked_at", write.locked_at.map(SurrealDatetime::from)))
            .bind(("next_worker", write.worker_id))
            .bind(("scheduled_at", SurrealDatetime::from(write.scheduled_at)))
            .bind(("error_code", error_code))
            .bind(("error_message", error_message))
            .bind(("last_error_at", write.last_error_at.map(SurrealDatetime::from)))
            .bind(("check_owner", write.event.requires_owner()))
            .bind(("owner", self.worker_id.clone().unwrap_or_default()))
            .await?
            .take(0)?;

        updated.ok_or_else(|| invalid_transition(self.state, write.event))
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<CompressionTask, AppError> {
        self.step(
            StepWrite {
                event: TaskEvent::StartProcessing,
                locked_at: Some(chrono::Utc::now()),
                worker_id: self.worker_id.clone(),
                scheduled_at: self.scheduled_at,
                error: ErrorWrite::Keep,
                last_error_at: self.last_error_at,
            },
            db,
        )
        .await
    }

    /// Acknowledges the task; earlier failure details are cleared.
    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<CompressionTask, AppError> {
        let now = chrono::Utc::now();
        self.step(
            StepWrite {
                event: TaskEvent::Succeed,
                locked_at: None,
                worker_id: None,
                scheduled_at: now,
                error: ErrorWrite::Clear,
                last_error_at: None,
            },
            db,
        )
        .await
    }

    /// Releases the lease and parks the task until `retry_delay` has passed.
    pub async fn mark_failed(
        &self,
        error: TaskErrorInfo,
        retry_delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<CompressionTask, AppError> {
        let now = chrono::Utc::now();
        let retry_at = now
            + ChronoDuration::from_std(retry_delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

        self.step(
            StepWrite {
                event: TaskEvent::Fail,
                locked_at: None,
                worker_id: None,
                scheduled_at: retry_at,
                error: ErrorWrite::Set(error),
                last_error_at: Some(now),
            },
            db,
        )
        .await
    }

    pub async fn mark_dead_letter(
        &self,
        error: TaskErrorInfo,
        db: &SurrealDbClient,
    ) -> Result<CompressionTask, AppError> {
        let now = chrono::Utc::now();
        self.step(
            StepWrite {
                event: TaskEvent::DeadLetter,
                locked_at: None,
                worker_id: None,
                scheduled_at: now,
                error: ErrorWrite::Set(error),
                last_error_at: Some(now),
            },
            db,
        )
        .await
    }

    /// Keeps only the newest `keep_succeeded` succeeded and `keep_dead` dead-lettered
    /// records. Returns how many records were removed.
    pub async fn prune_finished(
        db: &SurrealDbClient,
        keep_succeeded: usize,
        keep_dead: usize,
    ) -> Result<usize, AppError> {
        let mut removed = 0;

        for (state, keep) in [
            (TaskState::Succeeded, keep_succeeded),
            (TaskState::DeadLetter, keep_dead),
        ] {
            let stale: Vec<CompressionTask> = db
                .query(
                    "SELECT * FROM type::table($table)
                     WHERE state = $state
                     ORDER BY updated_at DESC
                     START $keep",
                )
                .bind(("table", Self::table_name()))
                .bind(("state", state.as_str()))
                .bind(("keep", keep))
                .await?
                .take(0)?;

            if stale.is_empty() {
                continue;
            }

            let ids: Vec<String> = stale.into_iter().map(|task| task.id).collect();
            removed += ids.len();

            db.query(
                "FOR $id IN $ids {
                    DELETE type::thing($table, $id);
                };",
            )
            .bind(("table", Self::table_name()))
            .bind(("ids", ids))
            .await?
            .check()?;
        }

        Ok(removed)
    }
}
