//! Application-level flows built on [`Connection::query`](super::Connection::query).
//!
//! Each one issues a single correlated request and interprets the reply; none
//! of them keeps state on the connection.

pub mod disco;
pub mod ping;
pub mod roster;
