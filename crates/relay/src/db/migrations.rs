use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, sqlite::SqlitePool};

pub static MIGRATOR: Migrator = sqlx::migrate!("./src/db/migrations");

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    MIGRATOR.run(pool).await.context("failed to apply relay sqlite migrations")
}

#[cfg(test)]
mod tests {
    use super::run_migrations;
    use crate::db::pool::{create_sqlite_pool, PoolConfig};

    #[tokio::test]
    async fn migrations_create_messages_table_and_are_idempotent() {
        let pool = create_sqlite_pool("sqlite::memory:", PoolConfig::default())
            .await
            .expect("in-memory pool should open");

        run_migrations(&pool).await.expect("migrations should apply");
        run_migrations(&pool).await.expect("re-running migrations should be a no-op");

        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('messages') ORDER BY cid")
                .fetch_all(&pool)
                .await
                .expect("table info should be readable");
        assert_eq!(columns, vec!["id", "client_offset", "content"]);
    }
}
