#[path = "../src/db/pool.rs"]
mod pool;

use pool::{check_pool_health, create_sqlite_pool, PoolConfig};

#[tokio::test]
async fn file_pool_runs_in_wal_mode() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let url = format!("sqlite://{}", dir.path().join("chat.db").display());

    let pool = create_sqlite_pool(&url, PoolConfig::default())
        .await
        .expect("pool should open the test database");
    check_pool_health(&pool).await.expect("health check query should succeed");

    let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .expect("journal mode should be readable");
    assert_eq!(journal_mode.to_ascii_lowercase(), "wal");
    pool.close().await;
}

#[tokio::test]
async fn file_pool_serves_reads_while_a_write_transaction_is_open() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let url = format!("sqlite://{}", dir.path().join("chat.db").display());
    let config = PoolConfig { max_connections: 2, ..PoolConfig::default() };
    let pool = create_sqlite_pool(&url, config).await.expect("pool should open");

    sqlx::query("CREATE TABLE lines (id INTEGER PRIMARY KEY, body TEXT NOT NULL)")
        .execute(&pool)
        .await
        .expect("table should be created");
    sqlx::query("INSERT INTO lines (body) VALUES ('committed')")
        .execute(&pool)
        .await
        .expect("row should insert");

    let mut writer = pool.begin().await.expect("write transaction should start");
    sqlx::query("INSERT INTO lines (body) VALUES ('uncommitted')")
        .execute(&mut *writer)
        .await
        .expect("row should insert inside transaction");

    let visible: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lines")
        .fetch_one(&pool)
        .await
        .expect("reader should not block on the open write");
    assert_eq!(visible, 1);

    writer.commit().await.expect("write should commit");
    let visible: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lines")
        .fetch_one(&pool)
        .await
        .expect("count should be readable");
    assert_eq!(visible, 2);
    pool.close().await;
}
