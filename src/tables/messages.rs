//! Message table operations for pgtxq.
//!
//! [`Messages`] renders every statement for the configured table once at
//! construction and executes them with bind parameters. The one exception is
//! the claim statement: its text depends on the registered queue set, so it
//! is memoized and rebuilt whenever [`Messages::set_queues`] changes the set.
//!
//! The method signatures encode the transactional contract: insertion, claim
//! and success run inside the claim transaction, while retry and give-up also
//! accept an independent connection so a rolled-back handler can still have
//! its retry schedule persisted.

use crate::config::{validate_identifier, Config};
use crate::constants::{STATUS_DONE, STATUS_GIVEN_UP, STATUS_WAIT};
use crate::error::{Error, Result};
use crate::types::{Message, NewMessage};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::sync::RwLock;
use std::time::Duration;

const COLUMNS: &str = "id, queue, status, created_at, try_count, retry_at, data";

/// Registered queue set plus the memoized claim statement derived from it.
#[derive(Default)]
struct ClaimState {
    queues: Vec<String>,
    sql: Option<String>,
}

/// Statement generation and execution for one message table.
///
/// Shared between the producer and the consumer of an engine; all interior
/// mutability is the queue set behind a read-write lock, so a `Messages`
/// value is used through an `Arc`.
pub struct Messages {
    table: String,
    create_table_sql: String,
    create_index_sql: String,
    insert_sql: String,
    mark_success_sql: String,
    mark_retry_sql: String,
    mark_given_up_sql: String,
    clean_sql: String,
    retention: Duration,
    claim: RwLock<ClaimState>,
}

impl Messages {
    /// Build the adapter for the table named in `config`.
    ///
    /// The table name is validated as a SQL identifier; it is the only string
    /// ever interpolated into statement text besides quoted queue names.
    pub fn new(config: &Config) -> Result<Self> {
        validate_identifier(&config.table)?;
        let table = config.table.clone();

        let create_table_sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id            bigserial    NOT NULL PRIMARY KEY,
                queue         text         NOT NULL,
                status        text         NOT NULL,
                created_at    timestamptz  NOT NULL,
                try_count     smallint     NOT NULL,
                retry_at      timestamptz  NOT NULL,
                data          jsonb        NOT NULL
            )
            "#
        );
        let create_index_sql = format!(
            "CREATE INDEX IF NOT EXISTS {table}_retry_at ON {table} (retry_at) WHERE status = '{STATUS_WAIT}'"
        );
        let insert_sql = format!(
            r#"
            INSERT INTO {table} (queue, status, created_at, try_count, retry_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {COLUMNS}
            "#
        );
        let mark_success_sql = format!(
            r#"
            UPDATE {table}
            SET status = $1, try_count = try_count + 1, retry_at = $2
            WHERE id = $3
            "#
        );
        let mark_retry_sql = format!(
            r#"
            UPDATE {table}
            SET try_count = try_count + 1, retry_at = $1
            WHERE id = $2
            "#
        );
        let mark_given_up_sql = mark_success_sql.clone();
        let clean_sql = format!(
            r#"
            DELETE FROM {table}
            WHERE status IN ($1, $2) AND retry_at < $3
            "#
        );

        Ok(Self {
            table,
            create_table_sql,
            create_index_sql,
            insert_sql,
            mark_success_sql,
            mark_retry_sql,
            mark_given_up_sql,
            clean_sql,
            retention: config.retention(),
            claim: RwLock::new(ClaimState::default()),
        })
    }

    /// Name of the underlying table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table and its partial index if they do not exist.
    ///
    /// The index covers `retry_at` for wait-status rows only, so claims stay
    /// O(log n) in the eligible set rather than in total table size.
    pub async fn install(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(&self.create_table_sql).execute(pool).await?;
        sqlx::query(&self.create_index_sql).execute(pool).await?;
        Ok(())
    }

    /// Atomically replace the registered queue set.
    ///
    /// Drops the memoized claim statement; the next poll picks up the new
    /// set.
    pub fn set_queues(&self, queues: Vec<String>) {
        let mut state = self.claim.write().expect("queue set lock poisoned");
        state.queues = queues;
        state.sql = None;
    }

    /// The currently registered queue set.
    pub fn queues(&self) -> Vec<String> {
        self.claim
            .read()
            .expect("queue set lock poisoned")
            .queues
            .clone()
    }

    /// Whether any queue is registered for consumption.
    pub fn has_queues(&self) -> bool {
        !self
            .claim
            .read()
            .expect("queue set lock poisoned")
            .queues
            .is_empty()
    }

    /// The claim statement for the current queue set, or `None` when the set
    /// is empty. Memoized until `set_queues` invalidates it.
    fn claim_sql(&self) -> Option<String> {
        {
            let state = self.claim.read().expect("queue set lock poisoned");
            if state.queues.is_empty() {
                return None;
            }
            if let Some(sql) = &state.sql {
                return Some(sql.clone());
            }
        }

        let mut state = self.claim.write().expect("queue set lock poisoned");
        if state.queues.is_empty() {
            return None;
        }
        if state.sql.is_none() {
            let mut quoted: Vec<String> = state.queues.iter().map(|q| quote(q)).collect();
            quoted.sort();
            state.sql = Some(format!(
                r#"
                SELECT {COLUMNS}
                FROM {table}
                WHERE queue IN ({queues}) AND status = '{STATUS_WAIT}'
                ORDER BY retry_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
                table = self.table,
                queues = quoted.join(","),
            ));
        }
        state.sql.clone()
    }

    /// Insert one message inside the caller's transaction.
    ///
    /// `created_at` defaults to now and `retry_at` to `created_at`, so an
    /// unadorned message is immediately eligible. The row starts in the wait
    /// status with `try_count` 0.
    pub async fn produce(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        msg: NewMessage,
    ) -> Result<Message> {
        if msg.queue.is_empty() {
            return Err(Error::InvalidMessage {
                message: "queue name cannot be empty".to_string(),
            });
        }

        let created_at = msg.created_at.unwrap_or_else(Utc::now);
        let retry_at = msg.retry_at.unwrap_or(created_at);

        let row = sqlx::query_as::<_, Message>(&self.insert_sql)
            .bind(&msg.queue)
            .bind(STATUS_WAIT)
            .bind(created_at)
            .bind(0i16)
            .bind(retry_at)
            .bind(&msg.data)
            .fetch_one(&mut **tx)
            .await?;

        Ok(row)
    }

    /// Claim the earliest eligible message among the registered queues.
    ///
    /// Takes a row-level exclusive lock and skips rows locked by other
    /// transactions. Returns `None` when no eligible row exists or no queues
    /// are registered. The returned row may have a `retry_at` in the future;
    /// the caller decides whether to dispatch or sleep until then.
    pub async fn earliest_message(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<Message>> {
        let Some(sql) = self.claim_sql() else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, Message>(&sql)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    /// Mark a claimed message done.
    ///
    /// Must run in the transaction that claimed the row so the commit
    /// publishes success atomically with the handler's writes.
    pub async fn mark_success(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        msg: &Message,
    ) -> Result<()> {
        sqlx::query(&self.mark_success_sql)
            .bind(STATUS_DONE)
            .bind(Utc::now())
            .bind(msg.id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Push a message's `retry_at` forward by `retry_after` and bump its
    /// try count. Status stays wait.
    ///
    /// Accepts any connection: the claim transaction when the handler's
    /// writes are kept, or an independent connection when they are rolled
    /// back.
    pub async fn mark_retry(
        &self,
        conn: &mut PgConnection,
        msg: &Message,
        retry_after: Duration,
    ) -> Result<()> {
        sqlx::query(&self.mark_retry_sql)
            .bind(retry_time(retry_after))
            .bind(msg.id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Transition a message to the given-up status. Same dual-context rule
    /// as [`Messages::mark_retry`].
    pub async fn mark_given_up(&self, conn: &mut PgConnection, msg: &Message) -> Result<()> {
        sqlx::query(&self.mark_given_up_sql)
            .bind(STATUS_GIVEN_UP)
            .bind(Utc::now())
            .bind(msg.id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Delete done and given-up rows whose completion instant is older than
    /// the configured retention. Returns the number of rows deleted.
    pub async fn clean_messages(&self, pool: &PgPool) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = sqlx::query(&self.clean_sql)
            .bind(STATUS_DONE)
            .bind(STATUS_GIVEN_UP)
            .bind(cutoff)
            .execute(pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

/// The instant `after` from now, saturating at the timestamp range limit.
fn retry_time(after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Quote a string literal, removing all NUL bytes in it.
fn quote(s: &str) -> String {
    let escaped = s.replace('\'', "''").replace('\0', "");
    format!("'{}'", escaped)
}
