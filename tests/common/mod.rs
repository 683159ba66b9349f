//! Shared helpers for integration tests.
//!
//! Tests run against a real PostgreSQL named by the `PGTXQ_TEST_DSN`
//! environment variable and are skipped when it is unset. Each test uses its
//! own table so tests can run concurrently.

use pgtxq::{Config, Message, Messages, NewMessage, Producer};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct TestEngine {
    pub pool: PgPool,
    pub table: Arc<Messages>,
    pub config: Config,
}

/// Connect to the test database and install a fresh table, or `None` when no
/// test DSN is configured.
#[allow(dead_code)]
pub async fn setup(table_name: &str) -> Option<TestEngine> {
    let dsn = std::env::var("PGTXQ_TEST_DSN").ok()?;

    let config = Config::from_dsn(dsn)
        .with_table(table_name)
        .expect("valid test table name")
        .with_idle_wait(1)
        .with_error_wait(1);

    let pool = pgtxq::connect(&config).await.expect("connect to test database");
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table_name))
        .execute(&pool)
        .await
        .expect("drop stale test table");

    let table = Arc::new(Messages::new(&config).expect("build table adapter"));
    table.install(&pool).await.expect("install schema");

    Some(TestEngine { pool, table, config })
}

/// Produce one message in its own committed transaction.
#[allow(dead_code)]
pub async fn produce(engine: &TestEngine, queue: &str, payload: serde_json::Value) -> Message {
    let producer = Producer::new(engine.table.clone());
    let mut tx = engine.pool.begin().await.expect("begin");
    let msg = producer
        .produce(&mut tx, NewMessage::new(queue, &payload).expect("new message"))
        .await
        .expect("produce");
    tx.commit().await.expect("commit");
    msg
}

/// Fetch the current row for a message.
#[allow(dead_code)]
pub async fn fetch_message(pool: &PgPool, table: &str, id: i64) -> Message {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT id, queue, status, created_at, try_count, retry_at, data FROM {} WHERE id = $1",
        table
    ))
    .bind(id)
    .fetch_one(pool)
    .await
    .expect("fetch message row")
}

/// Poll a message row until `pred` holds, panicking after `deadline`.
#[allow(dead_code)]
pub async fn wait_until<F>(
    pool: &PgPool,
    table: &str,
    id: i64,
    deadline: Duration,
    pred: F,
) -> Message
where
    F: Fn(&Message) -> bool,
{
    let start = Instant::now();
    loop {
        let msg = fetch_message(pool, table, id).await;
        if pred(&msg) {
            return msg;
        }
        if start.elapsed() > deadline {
            panic!("condition not met within {:?}; last state: {}", deadline, msg);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
