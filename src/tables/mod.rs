//! Table adapters: statement generation and execution for the message table.

mod messages;

pub use messages::Messages;
