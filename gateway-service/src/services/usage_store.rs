use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::config::RedisConfig;
use crate::models::IdentityRecord;

/// Day buckets outlive their day by one more, then expire on their own.
const DAY_BUCKET_TTL_SECONDS: i64 = 2 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Usage store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt usage record: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Durable per-identity usage counters keyed by (identity, UTC day).
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically add one to the day bucket and return the new count.
    async fn increment(&self, identity: &str, day: NaiveDate) -> Result<u64, StoreError>;
    async fn count(&self, identity: &str, day: NaiveDate) -> Result<u64, StoreError>;
    async fn total(&self, identity: &str) -> Result<u64, StoreError>;
    /// Create the identity on first sight, otherwise touch its last access time.
    async fn upsert_identity(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError>;
    async fn get_identity(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError>;
    async fn health_check(&self) -> Result<(), StoreError>;
}

fn day_key(identity: &str, day: NaiveDate) -> String {
    format!("quota:{}:{}", identity, day.format("%Y-%m-%d"))
}

fn total_key(identity: &str) -> String {
    format!("usage_total:{}", identity)
}

fn identity_key(identity: &str) -> String {
    format!("identity:{}", identity)
}

#[derive(Clone)]
pub struct RedisUsageStore {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisUsageStore {
    pub async fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        tracing::info!("Connecting to Redis usage store");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            StoreError::Unavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    fn parse_identity(
        identity: &str,
        fields: HashMap<String, String>,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        if fields.is_empty() {
            return Ok(None);
        }

        let parse = |field: &str| -> Result<DateTime<Utc>, StoreError> {
            let raw = fields
                .get(field)
                .ok_or_else(|| StoreError::Corrupt(format!("{} missing for {}", field, identity)))?;
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt(format!("{} for {}: {}", field, identity, e)))
        };

        Ok(Some(IdentityRecord {
            identity: identity.to_string(),
            created_at: parse("created_at")?,
            last_access_at: parse("last_access_at")?,
        }))
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn increment(&self, identity: &str, day: NaiveDate) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let key = day_key(identity, day);

        let (count, _total): (u64, u64) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, DAY_BUCKET_TTL_SECONDS)
            .ignore()
            .incr(total_key(identity), 1u64)
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn count(&self, identity: &str, day: NaiveDate) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let count: Option<u64> = redis::cmd("GET")
            .arg(day_key(identity, day))
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn total(&self, identity: &str) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let total: Option<u64> = redis::cmd("GET")
            .arg(total_key(identity))
            .query_async(&mut conn)
            .await?;
        Ok(total.unwrap_or(0))
    }

    async fn upsert_identity(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError> {
        let mut conn = self.manager.clone();
        let key = identity_key(identity);
        let stamp = now.to_rfc3339();

        let (fields,): (HashMap<String, String>,) = redis::pipe()
            .atomic()
            .hset_nx(&key, "created_at", &stamp)
            .ignore()
            .hset(&key, "last_access_at", &stamp)
            .ignore()
            .hgetall(&key)
            .query_async(&mut conn)
            .await?;

        Self::parse_identity(identity, fields)?
            .ok_or_else(|| StoreError::Corrupt(format!("identity {} vanished", identity)))
    }

    async fn get_identity(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let mut conn = self.manager.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(identity_key(identity))
            .query_async(&mut conn)
            .await?;
        Self::parse_identity(identity, fields)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(format!("Redis health check failed: {}", e)))
    }
}

/// Process-local store, used when no Redis URL is configured and in tests.
pub struct InMemoryUsageStore {
    counts: DashMap<(String, NaiveDate), u64>,
    totals: DashMap<String, u64>,
    identities: DashMap<String, IdentityRecord>,
    available: AtomicBool,
}

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
            totals: DashMap::new(),
            identities: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn increment(&self, identity: &str, day: NaiveDate) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let key = (identity.to_string(), day);

        // First write of a new day drops buckets older than yesterday.
        if !self.counts.contains_key(&key) {
            if let Some(yesterday) = day.pred_opt() {
                self.counts.retain(|(_, d), _| *d >= yesterday);
            }
        }

        let count = {
            let mut entry = self.counts.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        *self.totals.entry(identity.to_string()).or_insert(0) += 1;

        Ok(count)
    }

    async fn count(&self, identity: &str, day: NaiveDate) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self
            .counts
            .get(&(identity.to_string(), day))
            .map(|c| *c)
            .unwrap_or(0))
    }

    async fn total(&self, identity: &str) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self.totals.get(identity).map(|t| *t).unwrap_or(0))
    }

    async fn upsert_identity(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError> {
        self.ensure_available()?;
        let mut record = self
            .identities
            .entry(identity.to_string())
            .or_insert_with(|| IdentityRecord {
                identity: identity.to_string(),
                created_at: now,
                last_access_at: now,
            });
        record.last_access_at = now;
        Ok(record.clone())
    }

    async fn get_identity(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError> {
        self.ensure_available()?;
        Ok(self.identities.get(identity).map(|r| r.clone()))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn keys_are_bucketed_by_identity_and_day() {
        assert_eq!(day_key("a@b.edu", day(7)), "quota:a@b.edu:2024-03-07");
        assert_eq!(total_key("a@b.edu"), "usage_total:a@b.edu");
    }

    #[tokio::test]
    async fn increments_are_per_day_and_totals_accumulate() {
        let store = InMemoryUsageStore::new();

        assert_eq!(store.increment("a@b.edu", day(1)).await.unwrap(), 1);
        assert_eq!(store.increment("a@b.edu", day(1)).await.unwrap(), 2);
        assert_eq!(store.increment("a@b.edu", day(2)).await.unwrap(), 1);

        assert_eq!(store.count("a@b.edu", day(1)).await.unwrap(), 2);
        assert_eq!(store.count("a@b.edu", day(2)).await.unwrap(), 1);
        assert_eq!(store.count("c@d.edu", day(1)).await.unwrap(), 0);
        assert_eq!(store.total("a@b.edu").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_and_moves_last_access() {
        let store = InMemoryUsageStore::new();
        let first = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let later = first + Duration::hours(3);

        let created = store.upsert_identity("a@b.edu", first).await.unwrap();
        let touched = store.upsert_identity("a@b.edu", later).await.unwrap();

        assert_eq!(created.created_at, first);
        assert_eq!(touched.created_at, first);
        assert_eq!(touched.last_access_at, later);
        assert_eq!(
            store.get_identity("a@b.edu").await.unwrap(),
            Some(touched)
        );
        assert_eq!(store.get_identity("nobody@b.edu").await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = InMemoryUsageStore::new();
        store.set_available(false);

        assert!(matches!(
            store.increment("a@b.edu", day(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.count("a@b.edu", day(1)).await.is_err());
        assert!(store.health_check().await.is_err());

        store.set_available(true);
        assert!(store.health_check().await.is_ok());
    }

    #[test]
    fn redis_identity_hash_round_trips_timestamps() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let fields = HashMap::from([
            ("created_at".to_string(), now.to_rfc3339()),
            ("last_access_at".to_string(), now.to_rfc3339()),
        ]);

        let record = RedisUsageStore::parse_identity("a@b.edu", fields)
            .unwrap()
            .unwrap();
        assert_eq!(record.created_at, now);

        assert!(RedisUsageStore::parse_identity("a@b.edu", HashMap::new())
            .unwrap()
            .is_none());
        assert!(matches!(
            RedisUsageStore::parse_identity(
                "a@b.edu",
                HashMap::from([("created_at".to_string(), "yesterday".to_string())])
            ),
            Err(StoreError::Corrupt(_))
        ));
    }
}
