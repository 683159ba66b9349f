//! Handler contract and registry.
//!
//! A [`Handler`] processes one claimed message inside the claim transaction.
//! Returning `Ok(())` marks the message done and commits; returning a
//! [`HandlerFailure`] drives the retry policy:
//!
//! - `retry_after: Some(d)` requeues the message `d` from now,
//!   `retry_after: None` gives it up for good.
//! - `commit_tx: true` keeps whatever the handler wrote through the
//!   transaction; `commit_tx: false` rolls it back while the retry schedule
//!   is persisted on an independent connection.
//!
//! `Ok(())` always wins: there is no way to report success and also roll the
//! transaction back or request a retry.

use crate::error::BoxError;
use crate::types::Message;
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Outcome of one handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerFailure>;

/// Processes claimed messages for one queue.
///
/// The transaction handed to `handle` is the claim transaction holding the
/// row lock; writes made through it share fate with the message's status
/// transition according to the returned [`HandlerResult`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        msg: &Message,
    ) -> HandlerResult;
}

/// A failed handler invocation, carrying the retry decision.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Delay before the next attempt; `None` means give up
    pub retry_after: Option<Duration>,
    /// Whether the handler's transaction side effects should be committed
    pub commit_tx: bool,
    /// The underlying error, for logging
    pub source: BoxError,
}

impl HandlerFailure {
    /// Requeue after `after`, keeping the handler's transaction writes.
    pub fn retry(after: Duration, source: impl Into<BoxError>) -> Self {
        Self {
            retry_after: Some(after),
            commit_tx: true,
            source: source.into(),
        }
    }

    /// Requeue after `after`, discarding the handler's transaction writes.
    pub fn retry_discarding(after: Duration, source: impl Into<BoxError>) -> Self {
        Self {
            retry_after: Some(after),
            commit_tx: false,
            source: source.into(),
        }
    }

    /// Stop delivering this message, keeping the handler's transaction writes.
    pub fn give_up(source: impl Into<BoxError>) -> Self {
        Self {
            retry_after: None,
            commit_tx: true,
            source: source.into(),
        }
    }

    /// Stop delivering this message, discarding the handler's transaction writes.
    pub fn give_up_discarding(source: impl Into<BoxError>) -> Self {
        Self {
            retry_after: None,
            commit_tx: false,
            source: source.into(),
        }
    }
}

// Display spells out the disposition so a single log line carries the whole
// retry decision.
impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after {
            Some(after) => write!(f, "{} (retry in {:?})", self.source, after),
            None => write!(f, "{} (giving up)", self.source),
        }
    }
}

/// Queue-name to handler mapping, written during configuration and read by
/// the dispatcher.
#[derive(Default)]
pub(crate) struct Registry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Registry {
    pub(crate) fn insert(&self, queue: String, handler: Arc<dyn Handler>) {
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(queue, handler);
    }

    pub(crate) fn get(&self, queue: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(queue)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(
            &self,
            _tx: &mut Transaction<'static, Postgres>,
            _msg: &Message,
        ) -> HandlerResult {
            Ok(())
        }
    }

    struct OtherHandler;

    #[async_trait]
    impl Handler for OtherHandler {
        async fn handle(
            &self,
            _tx: &mut Transaction<'static, Postgres>,
            _msg: &Message,
        ) -> HandlerResult {
            Err(HandlerFailure::give_up("nope"))
        }
    }

    #[test]
    fn test_failure_constructors() {
        let f = HandlerFailure::retry(Duration::from_secs(5), "soft");
        assert_eq!(f.retry_after, Some(Duration::from_secs(5)));
        assert!(f.commit_tx);

        let f = HandlerFailure::retry_discarding(Duration::ZERO, "hard");
        assert_eq!(f.retry_after, Some(Duration::ZERO));
        assert!(!f.commit_tx);

        let f = HandlerFailure::give_up("fatal");
        assert_eq!(f.retry_after, None);
        assert!(f.commit_tx);

        let f = HandlerFailure::give_up_discarding("fatal");
        assert_eq!(f.retry_after, None);
        assert!(!f.commit_tx);
    }

    #[test]
    fn test_failure_display() {
        let f = HandlerFailure::retry(Duration::from_secs(5), "soft");
        assert!(f.to_string().contains("retry in"));

        let f = HandlerFailure::give_up("fatal");
        assert!(f.to_string().contains("giving up"));
    }

    #[test]
    fn test_registry_insert_get_replace() {
        let registry = Registry::default();
        assert!(registry.get("email").is_none());

        registry.insert("email".to_string(), Arc::new(NoopHandler));
        assert!(registry.get("email").is_some());
        assert!(registry.get("other").is_none());

        // Re-registering replaces the previous handler.
        registry.insert("email".to_string(), Arc::new(OtherHandler));
        assert!(registry.get("email").is_some());
    }
}
