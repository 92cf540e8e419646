// Durable, append-only chat message log.

use anyhow::Context;
use futures_util::stream::{BoxStream, StreamExt};
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};

use crate::db::migrations::run_migrations;
use crate::db::pool::check_pool_health;
use crate::metrics;

/// One persisted chat message. `id` is the replay cursor.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: i64,
    pub client_offset: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(ChatMessage),
    /// The client offset was already recorded under `id`; nothing was written.
    Duplicate { id: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message store is unavailable")]
    Unavailable(#[source] sqlx::Error),
    #[error("message store operation failed")]
    Storage(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Self::Unavailable(error)
            }
            other => Self::Storage(other),
        }
    }
}

#[derive(Debug)]
pub struct MessageStore {
    pool: SqlitePool,
    // Held across the duplicate check and the insert so ids are handed out
    // one append at a time. Reads never take it.
    append_lock: Mutex<()>,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, append_lock: Mutex::new(()) }
    }

    /// Applies migrations and wraps the pool.
    pub async fn open(pool: SqlitePool) -> anyhow::Result<Self> {
        check_pool_health(&pool).await.context("message database is not reachable")?;
        run_migrations(&pool).await?;
        let store = Self::new(pool);
        let latest_id =
            store.latest_id().await.context("failed to read latest message id on startup")?;
        metrics::set_latest_message_id(latest_id);
        info!(latest_id, "message store opened");
        Ok(store)
    }

    /// Persists `content`, assigning the next id.
    ///
    /// A `client_offset` that is already recorded yields
    /// [`AppendOutcome::Duplicate`] and consumes no id.
    pub async fn append(
        &self,
        content: &str,
        client_offset: Option<&str>,
    ) -> Result<AppendOutcome, StoreError> {
        async {
            let _guard = self.append_lock.lock().await;
            let mut tx = self.pool.begin().await?;

            if let Some(offset) = client_offset {
                let existing = sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM messages WHERE client_offset = ?",
                )
                .bind(offset)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(id) = existing {
                    return Ok(AppendOutcome::Duplicate { id });
                }
            }

            let id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO messages (client_offset, content) VALUES (?, ?) RETURNING id",
            )
            .bind(client_offset)
            .bind(content)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok(AppendOutcome::Appended(ChatMessage {
                id,
                client_offset: client_offset.map(ToOwned::to_owned),
                content: content.to_owned(),
            }))
        }
        .instrument(info_span!(
            "relay.store.append",
            has_client_offset = client_offset.is_some()
        ))
        .await
    }

    /// Every message with `id > min_id`, ascending.
    ///
    /// Backed by one SQLite statement, so the rows come from a single
    /// snapshot: nothing committed before the call is skipped and nothing is
    /// yielded twice. Appends racing with the read may or may not appear.
    pub fn read_from(&self, min_id: i64) -> BoxStream<'_, Result<ChatMessage, StoreError>> {
        sqlx::query_as::<_, ChatMessage>(
            "SELECT id, client_offset, content FROM messages WHERE id > ? ORDER BY id ASC",
        )
        .bind(min_id)
        .fetch(&self.pool)
        .map(|row| row.map_err(StoreError::from))
        .boxed()
    }

    /// Highest committed id, or 0 for an empty log.
    pub async fn latest_id(&self) -> Result<i64, StoreError> {
        let latest = sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(id), 0) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) async fn for_tests() -> Self {
        use crate::db::pool::{create_sqlite_pool, PoolConfig};

        let pool = create_sqlite_pool("sqlite::memory:", PoolConfig::default())
            .await
            .expect("in-memory pool should open");
        Self::open(pool).await.expect("in-memory store should open")
    }
}
