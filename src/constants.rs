//! Message status values and configuration defaults.

/// Status of a message that is waiting to be consumed.
///
/// The empty string is deliberate: the partial index on `retry_at` filters on
/// this value, so the live part of the index stays as small as the eligible
/// set itself.
pub const STATUS_WAIT: &str = "";

/// Status of a message that was handled successfully.
pub const STATUS_DONE: &str = "done";

/// Status of a message whose handler gave up on it.
pub const STATUS_GIVEN_UP: &str = "givenUp";

// Default configuration values
pub(crate) const DEFAULT_TABLE: &str = "pgtxq_messages";
pub(crate) const DEFAULT_MAX_CONNECTIONS: u32 = 16;
pub(crate) const DEFAULT_CONNECTION_TIMEOUT_SECONDS: u64 = 30;
pub(crate) const DEFAULT_WAIT_SECONDS: u64 = 60;
pub(crate) const DEFAULT_TX_TIMEOUT_SECONDS: u64 = 60;
pub(crate) const DEFAULT_RETENTION_SECONDS: u64 = 30 * 24 * 60 * 60;
