//! Consumer loop and per-message dispatcher.
//!
//! [`Consumer::consume`] polls the message table for work and sleeps
//! adaptively when there is none: the computed wait is clamped to the idle
//! wait, errors back off by the error wait, and any sleep is cut short by
//! [`Consumer::trigger_consume`]. Each claimed message is dispatched on its
//! own task inside its own transaction, so the loop keeps claiming while
//! handlers run.
//!
//! Correctness across processes comes entirely from the database: the claim
//! query locks the row and skips rows locked by other transactions, so any
//! number of consumers can share one table.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{Handler, Registry};
use crate::tables::Messages;
use crate::types::Message;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Reschedule distance for messages whose queue has no registered handler.
/// Self-heals once a handler is registered, without operator intervention.
const UNKNOWN_QUEUE_RETRY: Duration = Duration::from_secs(60);

/// Pause before rolling back a discarded handler transaction, so the
/// detached bookkeeping can queue on the row lock first. A latency hint, not
/// a correctness requirement.
const LOCK_HANDOFF_PAUSE: Duration = Duration::from_millis(100);

/// What to do with the claim transaction after a dispatch.
enum TxAction {
    Commit,
    Rollback,
}

/// Claims and dispatches messages from one table.
///
/// Cloning is cheap (shared pool, table adapter, registry and wake-up), and
/// every clone addresses the same engine instance. Run the loop with
/// [`Consumer::consume`]; configure it with [`Consumer::set_queues`] and
/// [`Consumer::register`], which are safe to call while the loop runs.
#[derive(Clone)]
pub struct Consumer {
    pool: PgPool,
    table: Arc<Messages>,
    handlers: Arc<Registry>,
    notify: Arc<Notify>,
    config: Config,
}

impl Consumer {
    pub fn new(pool: PgPool, table: Arc<Messages>, config: Config) -> Self {
        Self {
            pool,
            table,
            handlers: Arc::new(Registry::default()),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    /// Add or replace the handler for `queue`.
    pub fn register<H: Handler + 'static>(&self, queue: impl Into<String>, handler: H) {
        self.handlers.insert(queue.into(), Arc::new(handler));
    }

    /// Atomically replace the set of queues this consumer claims from.
    pub fn set_queues(&self, queues: Vec<String>) {
        self.table.set_queues(queues);
    }

    /// Wake the consumer loop from its current sleep.
    ///
    /// Non-blocking; any number of concurrent calls coalesce into a single
    /// stored wake-up.
    pub fn trigger_consume(&self) {
        self.notify.notify_one();
    }

    /// Run the consumer loop. Never returns in normal operation.
    ///
    /// Also starts the cleaner when a clean interval is configured. Errors
    /// never terminate the loop; they only decide the next sleep.
    pub async fn consume(&self) {
        if let Some(every) = self.config.clean_interval() {
            let worker = self.clone();
            tokio::spawn(async move { worker.clean_loop(every).await });
        }

        loop {
            let wait = self.consume_batch().await;
            if wait > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.notify.notified() => {}
                }
            }
        }
    }

    /// Drain due messages in a tight loop; return how long to sleep next.
    async fn consume_batch(&self) -> Duration {
        let idle_wait = self.config.idle_wait();
        if !self.table.has_queues() {
            return idle_wait;
        }
        loop {
            match self.consume_one(idle_wait).await {
                Ok(wait) if wait > Duration::ZERO => return wait.min(idle_wait),
                Ok(_) => {}
                Err(err) => {
                    tracing::error!("claiming next message failed: {}", err);
                    return self.config.error_wait();
                }
            }
        }
    }

    /// Claim the earliest eligible message.
    ///
    /// Returns the time until the next message is due: zero when one was
    /// claimed and handed to a dispatch task (more may be ready), the idle
    /// wait when the table had nothing for us.
    async fn consume_one(&self, idle_wait: Duration) -> Result<Duration> {
        let mut tx = self.pool.begin().await?;

        let claimed = match self.table.earliest_message(&mut tx).await {
            Ok(claimed) => claimed,
            Err(err) => {
                rollback(tx).await;
                return Err(err);
            }
        };

        let msg = match claimed {
            Some(msg) => msg,
            None => {
                rollback(tx).await;
                return Ok(idle_wait);
            }
        };

        let wait = until(msg.retry_at);
        if wait > Duration::ZERO {
            rollback(tx).await;
            return Ok(wait);
        }

        let worker = self.clone();
        tokio::spawn(async move { worker.dispatch(tx, msg).await });
        Ok(Duration::ZERO)
    }

    /// Run one claimed message to completion under the transaction deadline.
    async fn dispatch(self, mut tx: Transaction<'static, Postgres>, msg: Message) {
        let deadline = self.config.tx_timeout();
        match tokio::time::timeout(deadline, self.run_handler(&mut tx, &msg)).await {
            Ok(TxAction::Commit) => {
                if let Err(err) = tx.commit().await {
                    tracing::error!(
                        "commit failed for message {} on queue '{}': {}",
                        msg.id,
                        msg.queue,
                        err
                    );
                }
            }
            Ok(TxAction::Rollback) => rollback(tx).await,
            Err(_) => {
                tracing::warn!(
                    "transaction deadline {:?} exceeded for message {} on queue '{}'; rolling back",
                    deadline,
                    msg.id,
                    msg.queue
                );
                rollback(tx).await;
            }
        }
    }

    /// Invoke the handler and interpret its outcome into marks on the row.
    async fn run_handler(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        msg: &Message,
    ) -> TxAction {
        let handler = match self.handler_of(msg) {
            Ok(handler) => handler,
            Err(err) => {
                tracing::warn!("{}; rescheduling message {}", err, msg.id);
                self.mark_fail(&mut **tx, msg, Some(UNKNOWN_QUEUE_RETRY)).await;
                return TxAction::Commit;
            }
        };

        match handler.handle(tx, msg).await {
            Ok(()) => match self.table.mark_success(tx, msg).await {
                Ok(()) => {
                    tracing::debug!(
                        "message {} on queue '{}' done after {} tries",
                        msg.id,
                        msg.queue,
                        msg.try_count + 1
                    );
                    TxAction::Commit
                }
                Err(err) => {
                    tracing::error!("marking message {} done failed: {}", msg.id, err);
                    TxAction::Rollback
                }
            },
            Err(failure) => {
                tracing::error!(
                    "handler failed for message {} on queue '{}' (try {}): {}",
                    msg.id,
                    msg.queue,
                    msg.try_count + 1,
                    failure
                );
                if failure.commit_tx {
                    self.mark_fail(&mut **tx, msg, failure.retry_after).await;
                    TxAction::Commit
                } else {
                    let worker = self.clone();
                    let detached = msg.clone();
                    let retry_after = failure.retry_after;
                    tokio::spawn(async move {
                        worker.mark_fail_detached(&detached, retry_after).await
                    });
                    // Let the detached update queue on the row lock before the
                    // rollback releases it, so another consumer is unlikely to
                    // re-claim the row before its retry_at advances.
                    tokio::time::sleep(LOCK_HANDOFF_PAUSE).await;
                    TxAction::Rollback
                }
            }
        }
    }

    fn handler_of(&self, msg: &Message) -> Result<Arc<dyn Handler>> {
        self.handlers.get(&msg.queue).ok_or_else(|| Error::UnknownQueue {
            name: msg.queue.clone(),
        })
    }

    /// Persist a retry or give-up on `conn`, waking the loop after a retry.
    async fn mark_fail(
        &self,
        conn: &mut PgConnection,
        msg: &Message,
        retry_after: Option<Duration>,
    ) {
        match retry_after {
            Some(after) => {
                if let Err(err) = self.table.mark_retry(conn, msg, after).await {
                    tracing::error!("scheduling retry for message {} failed: {}", msg.id, err);
                } else {
                    self.trigger_consume();
                }
            }
            None => {
                if let Err(err) = self.table.mark_given_up(conn, msg).await {
                    tracing::error!("giving up message {} failed: {}", msg.id, err);
                }
            }
        }
    }

    /// Same as [`Consumer::mark_fail`], on a connection of our own, for
    /// handlers whose transaction is being rolled back.
    async fn mark_fail_detached(&self, msg: &Message, retry_after: Option<Duration>) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(
                    "acquiring connection to reschedule message {} failed: {}",
                    msg.id,
                    err
                );
                return;
            }
        };
        self.mark_fail(&mut *conn, msg, retry_after).await;
    }

    /// Periodically delete terminal rows past their retention.
    async fn clean_loop(self, every: Duration) {
        loop {
            match self.table.clean_messages(&self.pool).await {
                Ok(cleaned) => {
                    tracing::info!("cleaned {} finished messages from {}", cleaned, self.table.table());
                }
                Err(err) => tracing::error!("cleaning finished messages failed: {}", err),
            }
            tokio::time::sleep(every).await;
        }
    }
}

/// Time from now until `at`, clamped to zero for instants already past.
fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

async fn rollback(tx: Transaction<'static, Postgres>) {
    if let Err(err) = tx.rollback().await {
        tracing::error!("rollback failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn lazy_consumer() -> Consumer {
        let config = Config::from_dsn("postgresql://localhost/unused");
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.dsn)
            .expect("lazy pool");
        let table = Arc::new(Messages::new(&config).unwrap());
        Consumer::new(pool, table, config)
    }

    #[test]
    fn test_until_clamps_past_instants() {
        assert_eq!(until(Utc::now() - chrono::Duration::seconds(10)), Duration::ZERO);
        let ahead = until(Utc::now() + chrono::Duration::seconds(10));
        assert!(ahead > Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_set_queues_reaches_table() {
        let consumer = lazy_consumer();
        assert!(!consumer.table.has_queues());
        consumer.set_queues(vec!["email".to_string()]);
        assert!(consumer.table.has_queues());
    }

    #[tokio::test]
    async fn test_trigger_consume_coalesces_into_one_wakeup() {
        let consumer = lazy_consumer();

        // Several triggers while nothing is sleeping store a single wake-up.
        consumer.trigger_consume();
        consumer.trigger_consume();
        consumer.trigger_consume();

        tokio::time::timeout(Duration::from_millis(100), consumer.notify.notified())
            .await
            .expect("stored wake-up should complete immediately");

        let second =
            tokio::time::timeout(Duration::from_millis(100), consumer.notify.notified()).await;
        assert!(second.is_err(), "only one wake-up may be stored");
    }
}
