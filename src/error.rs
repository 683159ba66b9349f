//! Error types and result handling for pgtxq.
//!
//! [`Error`] enumerates the error cases that can occur when producing,
//! claiming, or marking messages; [`Result<T>`] is the alias used by every
//! fallible API in the crate.
//!
//! Handler failures are not part of this enum: a handler reports its outcome
//! through [`crate::handler::HandlerFailure`], which the dispatcher consumes
//! to drive the retry policy instead of propagating it.

use thiserror::Error;

/// Result type for pgtxq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type for heterogeneous error sources
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for pgtxq operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (SQLx errors)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization of a payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Required configuration field is missing
    #[error("missing required configuration: {field}")]
    MissingConfig { field: String },

    /// Configuration field has an invalid value
    #[error("invalid configuration value for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// Message rejected before insertion (e.g. empty queue name)
    #[error("invalid message: {message}")]
    InvalidMessage { message: String },

    /// A claimed message names a queue with no registered handler.
    ///
    /// Never surfaced to callers: the dispatcher reschedules the message and
    /// picks it up again once a handler appears.
    #[error("no handler registered for queue '{name}'")]
    UnknownQueue { name: String },
}
