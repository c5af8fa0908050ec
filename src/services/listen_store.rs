use crate::error::Result;
use crate::models::Listen;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Read and write access to the listen event store.
#[async_trait]
pub trait ListenStore: Send + Sync {
    /// Listens of `user_name` with `listened_at < to_ts`, newest first, at most `limit`.
    async fn fetch_listens(&self, user_name: &str, to_ts: i64, limit: i64) -> Result<Vec<Listen>>;

    /// Persist one validated batch owned by `user_name`.
    async fn insert_listens(&self, user_name: &str, listens: &[Listen]) -> Result<()>;

    async fn count_listens(&self, user_name: &str) -> Result<i64>;
}

/// Cached per-user listen counter derived from the store.
#[async_trait]
pub trait ListenCountCache: Send + Sync {
    async fn get_listen_count(&self, user_name: &str) -> Result<Option<i64>>;

    async fn set_listen_count(&self, user_name: &str, count: i64) -> Result<()>;

    /// Drop the cached counter so the next read recomputes it. Idempotent.
    async fn reset_listen_count(&self, user_name: &str) -> Result<()>;
}

/// Read the derived counter, recomputing and caching it on a miss.
pub async fn cached_listen_count(
    store: &dyn ListenStore,
    cache: &dyn ListenCountCache,
    user_name: &str,
) -> Result<i64> {
    if let Some(count) = cache.get_listen_count(user_name).await? {
        return Ok(count);
    }

    let count = store.count_listens(user_name).await?;
    cache.set_listen_count(user_name, count).await?;
    Ok(count)
}

#[derive(Clone)]
pub struct PgListenStore {
    db: PgPool,
}

impl PgListenStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ListenStore for PgListenStore {
    async fn fetch_listens(&self, user_name: &str, to_ts: i64, limit: i64) -> Result<Vec<Listen>> {
        let listens = sqlx::query_as::<_, Listen>(
            r#"
            SELECT user_name, listened_at, data, release_msid, artist_msid, recording_msid
            FROM listens
            WHERE user_name = $1 AND listened_at < $2
            ORDER BY listened_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_name)
        .bind(to_ts)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(listens)
    }

    async fn insert_listens(&self, user_name: &str, listens: &[Listen]) -> Result<()> {
        if listens.is_empty() {
            return Ok(());
        }

        let listened_at: Vec<i64> = listens.iter().map(|l| l.listened_at).collect();
        let data: Vec<Value> = listens
            .iter()
            .map(|l| Value::Object(l.data.clone()))
            .collect();
        let release_msids: Vec<Option<Uuid>> = listens.iter().map(|l| l.release_msid).collect();
        let artist_msids: Vec<Option<Uuid>> = listens.iter().map(|l| l.artist_msid).collect();
        let recording_msids: Vec<Option<Uuid>> =
            listens.iter().map(|l| l.recording_msid).collect();

        let mut tx = self.db.begin().await?;

        // Duplicates of an already stored (user, time, track) are dropped by the unique index
        let inserted = sqlx::query(
            r#"
            INSERT INTO listens (user_name, listened_at, data, release_msid, artist_msid, recording_msid)
            SELECT $1, t.listened_at, t.data, t.release_msid, t.artist_msid, t.recording_msid
            FROM UNNEST($2::bigint[], $3::jsonb[], $4::uuid[], $5::uuid[], $6::uuid[])
                AS t(listened_at, data, release_msid, artist_msid, recording_msid)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_name)
        .bind(&listened_at)
        .bind(&data)
        .bind(&release_msids)
        .bind(&artist_msids)
        .bind(&recording_msids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Inserted {} of {} listens for {}",
            inserted.rows_affected(),
            listens.len(),
            user_name
        );

        Ok(())
    }

    async fn count_listens(&self, user_name: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listens WHERE user_name = $1")
            .bind(user_name)
            .fetch_one(&self.db)
            .await?;

        Ok(count)
    }
}

#[derive(Clone)]
pub struct RedisListenCount {
    redis: ConnectionManager,
}

impl RedisListenCount {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(user_name: &str) -> String {
        format!("listen_count:{}", user_name)
    }
}

#[async_trait]
impl ListenCountCache for RedisListenCount {
    async fn get_listen_count(&self, user_name: &str) -> Result<Option<i64>> {
        let mut conn = self.redis.clone();
        let count: Option<i64> = conn.get(Self::key(user_name)).await?;
        Ok(count)
    }

    async fn set_listen_count(&self, user_name: &str, count: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(Self::key(user_name), count).await?;
        Ok(())
    }

    async fn reset_listen_count(&self, user_name: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(Self::key(user_name)).await?;
        Ok(())
    }
}
