//! # pgtxq
//!
//! A transactional PostgreSQL-backed message queue for Rust applications.
//!
//! Producers insert messages inside their own database transactions, so
//! publication is atomic with the business write that caused it. A consumer
//! loop claims the earliest eligible message with `FOR UPDATE SKIP LOCKED`,
//! runs the registered handler inside the claim transaction, and records the
//! outcome (done, retry later, given up) in the same transaction, so handler
//! side effects and the queue transition commit or roll back together.
//!
//! ## Features
//!
//! - Enqueue inside the caller's transaction: no message without its write,
//!   no write without its message
//! - Concurrent consumers across any number of processes, coordinated only
//!   by PostgreSQL row locks with SKIP LOCKED
//! - Per-message retry policy decided by the handler: delay, keep or discard
//!   transaction side effects, or give up
//! - Adaptive polling with a non-blocking wake-up to cut latency below the
//!   poll interval
//! - Background cleanup of finished messages on a configurable cadence
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use pgtxq::{Config, Consumer, Handler, HandlerResult, Message, Messages, NewMessage, Producer};
//! use sqlx::{Postgres, Transaction};
//! use std::sync::Arc;
//!
//! struct EmailHandler;
//!
//! #[async_trait]
//! impl Handler for EmailHandler {
//!     async fn handle(
//!         &self,
//!         _tx: &mut Transaction<'static, Postgres>,
//!         msg: &Message,
//!     ) -> HandlerResult {
//!         println!("sending {}", msg.data);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_dsn("postgresql://localhost/app");
//!     let pool = pgtxq::connect(&config).await?;
//!     let table = Arc::new(Messages::new(&config)?);
//!     table.install(&pool).await?;
//!
//!     // Produce inside your own transaction.
//!     let producer = Producer::new(table.clone());
//!     let mut tx = pool.begin().await?;
//!     let msg = NewMessage::new("email", &serde_json::json!({"to": "a@b"}))?;
//!     producer.produce(&mut tx, msg).await?;
//!     tx.commit().await?;
//!
//!     // Consume until the process exits.
//!     let consumer = Consumer::new(pool, table, config);
//!     consumer.register("email", EmailHandler);
//!     consumer.set_queues(vec!["email".to_string()]);
//!     consumer.consume().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod handler;
mod pool;
pub mod producer;
pub mod tables;
pub mod types;

pub use crate::config::Config;
pub use crate::constants::{STATUS_DONE, STATUS_GIVEN_UP, STATUS_WAIT};
pub use crate::consumer::Consumer;
pub use crate::error::{BoxError, Error, Result};
pub use crate::handler::{Handler, HandlerFailure, HandlerResult};
pub use crate::pool::connect;
pub use crate::producer::Producer;
pub use crate::tables::Messages;
pub use crate::types::{Message, NewMessage};
