//! Producer entry point.
//!
//! [`Producer::produce`] inserts a message inside a transaction owned by the
//! caller, so publication is atomic with the business write that caused it.
//! The caller commits or rolls back; the queue engine never opens the
//! transaction.

use crate::error::Result;
use crate::tables::Messages;
use crate::types::{Message, NewMessage};
use sqlx::{Postgres, Transaction};
use std::sync::Arc;

/// Enqueues messages through a shared table adapter.
#[derive(Clone)]
pub struct Producer {
    table: Arc<Messages>,
}

impl Producer {
    pub fn new(table: Arc<Messages>) -> Self {
        Self { table }
    }

    /// Insert `msg` inside the caller's transaction.
    ///
    /// Fills `created_at` (now) and `retry_at` (`created_at`) when the caller
    /// left them unset, and returns the stored row with its assigned id. The
    /// message becomes visible to consumers when the caller commits.
    pub async fn produce(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        msg: NewMessage,
    ) -> Result<Message> {
        self.table.produce(tx, msg).await
    }
}
