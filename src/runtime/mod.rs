//! Transport runtime built on tokio.
//!
//! - `framing`: newline-delimited text messages
//! - `connection`: `Connection` handles and the per-connection driver
//! - `listener`: listening socket, accept loop and connection table
//!
//! Chat semantics live outside this module; the runtime only moves lines
//! and reports lifecycle events.

mod connection;
mod framing;
mod listener;

pub use connection::{drive, Connection, ConnectionId, Ended, SendError};
pub use listener::{Listener, ServerHandler};

#[cfg(test)]
pub(crate) use connection::Outbound;
