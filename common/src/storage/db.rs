use crate::error::AppError;

use super::types::StoredObject;
use std::{future::Future, ops::Deref, time::Duration};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::warn;

/// Reruns after a transaction conflict before the error is surfaced.
const CONFLICT_RETRY_ATTEMPTS: usize = 12;
const CONFLICT_MAX_BACKOFF: Duration = Duration::from_millis(250);

pub fn is_retryable_conflict(error: &Error) -> bool {
    error
        .to_string()
        .contains("Failed to commit transaction due to a read or write conflict")
}

/// Runs `operation`, retrying with jittered backoff while SurrealDB reports a
/// read/write conflict. Any other error is returned at once.
pub async fn retry_on_conflict<T, F, Fut>(operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(5)
        .max_delay(CONFLICT_MAX_BACKOFF)
        .map(jitter)
        .take(CONFLICT_RETRY_ATTEMPTS);

    RetryIf::spawn(strategy, operation, |err: &Error| {
        let retry = is_retryable_conflict(err);
        if retry {
            warn!("Transient SurrealDB conflict; retrying");
        }
        retry
    })
    .await
}

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        Self::build_indexes(self).await?;

        Ok(())
    }

    pub async fn build_indexes(&self) -> Result<(), Error> {
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_status ON compression_job FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_user ON compression_job FIELDS user_id, created_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_batch ON compression_job FIELDS batch_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_expires ON compression_job FIELDS expires_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_task_state ON compression_task FIELDS state, scheduled_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS unique_api_key ON user FIELDS api_key_hash UNIQUE")
            .await?;

        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to retrieve
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The found item or Error
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Test helper: retrieve all objects of a table.
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }
}
