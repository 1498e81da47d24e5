//! TCP transport layer shared by the text and imaging clients.

pub mod connection;

pub use connection::{BackoffPolicy, Connection, ConnectionInfo, Timeouts};
