use std::sync::Arc;

use chrono::NaiveTime;
use sha2::{Digest, Sha256};
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::db::{retry_on_conflict, SurrealDbClient},
    stored_object,
};

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum Tier {
    #[serde(rename = "FREE")]
    #[default]
    Free,
    #[serde(rename = "PRO")]
    Pro,
    #[serde(rename = "ENTERPRISE")]
    Enterprise,
}

impl Tier {
    /// Uploads allowed per UTC day, `None` meaning unlimited.
    pub fn daily_limit(&self) -> Option<u32> {
        match self {
            Tier::Free => Some(10),
            Tier::Pro => Some(500),
            Tier::Enterprise => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "FREE",
            Tier::Pro => "PRO",
            Tier::Enterprise => "ENTERPRISE",
        }
    }
}

stored_object!(User, "user", {
    email: String,
    api_key_hash: String,
    tier: Tier,
    daily_uploads: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    daily_reset_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_used_at: Option<DateTime<Utc>>
});

pub fn hash_api_key(api_key: &str) -> String {
    format!("{:x}", Sha256::digest(api_key.as_bytes()))
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl User {
    /// Creates a user and returns it together with the raw API key. Only the hash is stored.
    pub async fn create_new(
        email: String,
        tier: Tier,
        db: &SurrealDbClient,
    ) -> Result<(Self, String), AppError> {
        let api_key = format!("sk_{}", Uuid::new_v4().to_string().replace('-', ""));
        let now = Utc::now();

        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            api_key_hash: hash_api_key(&api_key),
            tier,
            daily_uploads: 0,
            daily_reset_at: start_of_day(now),
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };

        let stored = db
            .store_item(user)
            .await?
            .ok_or_else(|| AppError::InternalError("User failed to create".into()))?;

        Ok((stored, api_key))
    }

    pub async fn find_by_api_key(
        api_key: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let user: Option<User> = db
            .client
            .query("SELECT * FROM type::table($table) WHERE api_key_hash = $hash LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("hash", hash_api_key(api_key)))
            .await?
            .take(0)?;

        Ok(user)
    }

    /// Uploads counted against today's limit, treating a stale counter as zero.
    pub fn uploads_today(&self, now: DateTime<Utc>) -> u32 {
        if self.daily_reset_at < start_of_day(now) {
            0
        } else {
            self.daily_uploads
        }
    }

    /// Atomically takes one unit of today's quota.
    ///
    /// The counter restarts at the first upload of a new UTC day. Fails with
    /// `QuotaExceeded` once the tier limit is reached; unlimited tiers always pass.
    pub async fn consume_daily_quota(
        &self,
        now: DateTime<Utc>,
        db: &SurrealDbClient,
    ) -> Result<User, AppError> {
        let Some(limit) = self.tier.daily_limit() else {
            return Ok(self.clone());
        };

        const CONSUME_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET daily_uploads = if daily_reset_at < $day_start THEN 1 ELSE daily_uploads + 1 END,
                daily_reset_at = if daily_reset_at < $day_start THEN $day_start ELSE daily_reset_at END,
                updated_at = $now
            WHERE daily_reset_at < $day_start OR daily_uploads < $limit
            RETURN AFTER;
        "#;

        let day_start = SurrealDatetime::from(start_of_day(now));
        let stamp = SurrealDatetime::from(now);

        // Parallel uploads by one user contend on this record.
        let updated: Option<User> = retry_on_conflict(|| {
            let (id, day_start, stamp) = (self.id.clone(), day_start.clone(), stamp.clone());
            async move {
                let updated: Option<User> = db
                    .client
                    .query(CONSUME_QUERY)
                    .bind(("table", Self::table_name()))
                    .bind(("id", id))
                    .bind(("day_start", day_start))
                    .bind(("now", stamp))
                    .bind(("limit", limit))
                    .await?
                    .take(0)?;
                Ok::<_, surrealdb::Error>(updated)
            }
        })
        .await?;

        updated.ok_or(AppError::QuotaExceeded { limit })
    }

    /// Gives back one unit taken today by `consume_daily_quota`.
    pub async fn refund_daily_quota(
        &self,
        now: DateTime<Utc>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if self.tier.daily_limit().is_none() {
            return Ok(());
        }

        const REFUND_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET daily_uploads = daily_uploads - 1,
                updated_at = $now
            WHERE daily_uploads > 0 AND daily_reset_at >= $day_start;
        "#;

        let day_start = SurrealDatetime::from(start_of_day(now));
        let stamp = SurrealDatetime::from(now);

        retry_on_conflict(|| {
            let (id, day_start, stamp) = (self.id.clone(), day_start.clone(), stamp.clone());
            async move {
                db.client
                    .query(REFUND_QUERY)
                    .bind(("table", Self::table_name()))
                    .bind(("id", id))
                    .bind(("day_start", day_start))
                    .bind(("now", stamp))
                    .await?
                    .check()
            }
        })
        .await?;

        Ok(())
    }

    /// Records API usage in the background. Failures are logged and never surface.
    pub fn touch_last_used(db: Arc<SurrealDbClient>, user_id: String) {
        tokio::spawn(async move {
            let now = Utc::now();
            let result = db
                .client
                .query("UPDATE type::thing($table, $id) SET last_used_at = $now")
                .bind(("table", Self::table_name()))
                .bind(("id", user_id.clone()))
                .bind(("now", SurrealDatetime::from(now)))
                .await
                .and_then(|response| response.check());

            if let Err(err) = result {
                tracing::debug!(%user_id, error = %err, "failed to record last API use");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_test_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");
        db
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(Tier::Free.daily_limit(), Some(10));
        assert_eq!(Tier::Pro.daily_limit(), Some(500));
        assert_eq!(Tier::Enterprise.daily_limit(), None);
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = hash_api_key("sk_test");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("sk_test"));
        assert_ne!(hash, hash_api_key("sk_other"));
    }

    #[tokio::test]
    async fn test_api_key_lookup_uses_hash() {
        let db = setup_test_db().await;

        let (user, api_key) = User::create_new("a@example.com".into(), Tier::Free, &db)
            .await
            .expect("Failed to create user");
        assert!(api_key.starts_with("sk_"));
        assert_ne!(user.api_key_hash, api_key);

        let found = User::find_by_api_key(&api_key, &db)
            .await
            .expect("lookup")
            .expect("user found");
        assert_eq!(found.id, user.id);

        let missing = User::find_by_api_key("sk_unknown", &db).await.expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_quota_stops_at_limit() {
        let db = setup_test_db().await;
        let (user, _) = User::create_new("q@example.com".into(), Tier::Free, &db)
            .await
            .expect("create");
        let now = Utc::now();

        for expected in 1..=10 {
            let updated = user.consume_daily_quota(now, &db).await.expect("within quota");
            assert_eq!(updated.daily_uploads, expected);
        }

        let exceeded = user.consume_daily_quota(now, &db).await;
        assert!(matches!(exceeded, Err(AppError::QuotaExceeded { limit: 10 })));

        let stored: User = db
            .get_item(&user.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.daily_uploads, 10);
    }

    async fn consume_concurrently(db: &Arc<SurrealDbClient>, user: &User, calls: usize) -> (usize, usize) {
        let now = Utc::now();
        let mut handles = Vec::with_capacity(calls);
        for _ in 0..calls {
            let db = Arc::clone(db);
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                user.consume_daily_quota(now, &db).await
            }));
        }

        let (mut ok, mut exceeded) = (0, 0);
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => ok += 1,
                Err(AppError::QuotaExceeded { .. }) => exceeded += 1,
                Err(other) => panic!("unexpected quota error: {other}"),
            }
        }
        (ok, exceeded)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_uploads_below_limit_all_count() {
        let db = Arc::new(setup_test_db().await);
        let (user, _) = User::create_new("p@example.com".into(), Tier::Pro, &db)
            .await
            .expect("create");

        let (ok, exceeded) = consume_concurrently(&db, &user, 8).await;
        assert_eq!((ok, exceeded), (8, 0));

        let stored: User = db
            .get_item(&user.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.daily_uploads, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_uploads_past_limit_are_quota_errors() {
        let db = Arc::new(setup_test_db().await);
        let (user, _) = User::create_new("c@example.com".into(), Tier::Free, &db)
            .await
            .expect("create");

        let (ok, exceeded) = consume_concurrently(&db, &user, 16).await;
        assert_eq!((ok, exceeded), (10, 6));

        let stored: User = db
            .get_item(&user.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.daily_uploads, 10);
    }

    #[tokio::test]
    async fn test_quota_resets_on_new_day() {
        let db = setup_test_db().await;
        let (user, _) = User::create_new("r@example.com".into(), Tier::Free, &db)
            .await
            .expect("create");
        let today = Utc::now();
        for _ in 0..10 {
            user.consume_daily_quota(today, &db).await.expect("consume");
        }

        let tomorrow = today + Duration::days(1);
        let updated = user
            .consume_daily_quota(tomorrow, &db)
            .await
            .expect("new day resets counter");
        assert_eq!(updated.daily_uploads, 1);
        assert_eq!(updated.daily_reset_at, start_of_day(tomorrow));
        assert_eq!(updated.uploads_today(tomorrow), 1);
    }

    #[tokio::test]
    async fn test_refund_returns_one_unit() {
        let db = setup_test_db().await;
        let (user, _) = User::create_new("f@example.com".into(), Tier::Free, &db)
            .await
            .expect("create");
        let now = Utc::now();

        user.consume_daily_quota(now, &db).await.expect("consume");
        user.consume_daily_quota(now, &db).await.expect("consume");
        user.refund_daily_quota(now, &db).await.expect("refund");

        let stored: User = db
            .get_item(&user.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.daily_uploads, 1);

        user.refund_daily_quota(now, &db).await.expect("refund");
        user.refund_daily_quota(now, &db).await.expect("refund at zero");
        let stored: User = db
            .get_item(&user.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.daily_uploads, 0);
    }

    #[tokio::test]
    async fn test_touch_last_used_records_timestamp() {
        let db = Arc::new(setup_test_db().await);
        let (user, _) = User::create_new("t@example.com".into(), Tier::Free, &db)
            .await
            .expect("create");
        assert!(user.last_used_at.is_none());

        User::touch_last_used(Arc::clone(&db), user.id.clone());

        let mut recorded = None;
        for _ in 0..50 {
            let stored: User = db
                .get_item(&user.id)
                .await
                .expect("fetch")
                .expect("exists");
            if stored.last_used_at.is_some() {
                recorded = stored.last_used_at;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(recorded.is_some());
    }

    #[tokio::test]
    async fn test_unlimited_tier_never_counts() {
        let db = setup_test_db().await;
        let (user, _) = User::create_new("e@example.com".into(), Tier::Enterprise, &db)
            .await
            .expect("create");

        for _ in 0..20 {
            user.consume_daily_quota(Utc::now(), &db)
                .await
                .expect("unlimited");
        }
    }

    #[test]
    fn test_uploads_today_ignores_stale_counter() {
        let now = Utc::now();
        let user = User {
            id: "u".into(),
            email: "s@example.com".into(),
            api_key_hash: String::new(),
            tier: Tier::Free,
            daily_uploads: 7,
            daily_reset_at: start_of_day(now) - Duration::days(1),
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };

        assert_eq!(user.uploads_today(now), 0);
    }
}
